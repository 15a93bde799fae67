//! Environment-driven configuration.
//!
//! Every recognized option is read directly from the process environment,
//! with `.env` loaded first through `dotenvy`. There is no layered file/CLI
//! config system here — the bridge is meant to run as a container with env
//! vars injected by the orchestrator.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Valkey,
    Redis,
    #[serde(rename = "clustered-valkey")]
    ClusteredValkey,
    #[serde(rename = "clustered-redis")]
    ClusteredRedis,
    Postgres,
}

impl StorageKind {
    pub fn is_clustered(self) -> bool {
        matches!(self, StorageKind::ClusteredValkey | StorageKind::ClusteredRedis)
    }

    pub fn is_single_backend(self) -> bool {
        matches!(self, StorageKind::Valkey | StorageKind::Redis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPubSubMode {
    Regular,
    Sharded,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub metrics_port: u16,
    pub storage: StorageKind,
    pub backend_uri: String,
    pub cluster_pubsub_mode: ClusterPubSubMode,
    pub heartbeat_interval: Duration,
    pub rps_limit: u32,
    pub connections_limit: u32,
    pub max_body_size: usize,
    pub rate_limit_bypass_tokens: Vec<String>,
    pub trusted_proxy_ranges: Vec<IpNet>,
    pub cors_enable: bool,
    pub connect_cache_size: usize,
    pub connect_cache_ttl: Duration,
    pub disconnect_events_ttl: u64,
    pub disconnect_event_max_size: usize,
    pub enable_expired_cache: bool,
    pub enable_transferred_cache: bool,
    pub webhook_urls: Vec<String>,
    pub copy_to_url: Option<String>,
    pub analytics_url: Option<String>,
    pub ntp_enabled: bool,
    pub ntp_servers: Vec<String>,
    pub ntp_sync_interval: Duration,
    pub ntp_query_timeout: Duration,
    pub self_signed_tls: bool,
    pub pprof_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let storage = env_opt("STORAGE")
            .map(|s| parse_storage(&s))
            .transpose()?
            .unwrap_or(StorageKind::Memory);

        let cluster_pubsub_mode = match env_opt("CLUSTER_PUBSUB_MODE").as_deref() {
            Some("sharded") => ClusterPubSubMode::Sharded,
            _ => ClusterPubSubMode::Regular,
        };

        let backend_uri = env_opt("VALKEY_URI")
            .or_else(|| env_opt("POSTGRES_URI"))
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let trusted_proxy_ranges = match env_opt("TRUSTED_PROXY_RANGES") {
            Some(raw) => parse_cidr_list(&raw)?,
            None => vec!["0.0.0.0/0".parse()?, "::/0".parse()?],
        };

        let cfg = Config {
            port: env_parsed("PORT", 8080)?,
            metrics_port: env_parsed("METRICS_PORT", 9090)?,
            storage,
            backend_uri,
            cluster_pubsub_mode,
            heartbeat_interval: Duration::from_secs(env_parsed("HEARTBEAT_INTERVAL", 10)?),
            rps_limit: env_parsed("RPS_LIMIT", 10)?,
            connections_limit: env_parsed("CONNECTIONS_LIMIT", 500)?,
            max_body_size: env_parsed::<usize>("MAX_BODY_SIZE", 10 * 1024 * 1024)?,
            rate_limit_bypass_tokens: env_opt("RATE_LIMITS_BY_PASS_TOKEN")
                .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
                .unwrap_or_default(),
            trusted_proxy_ranges,
            cors_enable: env_parsed("CORS_ENABLE", false)?,
            connect_cache_size: env_parsed("CONNECT_CACHE_SIZE", 2_000_000)?,
            connect_cache_ttl: Duration::from_secs(env_parsed("CONNECT_CACHE_TTL", 300)?),
            disconnect_events_ttl: env_parsed("DISCONNECT_EVENTS_TTL", 3600)?,
            disconnect_event_max_size: env_parsed("DISCONNECT_EVENT_MAX_SIZE", 512)?,
            enable_expired_cache: env_parsed("ENABLE_EXPIRED_CACHE", true)?,
            enable_transferred_cache: env_parsed("ENABLE_TRANSFERED_CACHE", true)?,
            webhook_urls: env_opt("WEBHOOK_URL")
                .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
                .unwrap_or_default(),
            copy_to_url: env_opt("COPY_TO_URL"),
            analytics_url: env_opt("ANALYTICS_URL"),
            ntp_enabled: env_parsed("NTP_ENABLED", false)?,
            ntp_servers: env_opt("NTP_SERVERS")
                .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
                .unwrap_or_else(|| vec!["pool.ntp.org:123".to_string()]),
            ntp_sync_interval: Duration::from_secs(env_parsed("NTP_SYNC_INTERVAL", 3600)?),
            ntp_query_timeout: Duration::from_millis(env_parsed("NTP_QUERY_TIMEOUT", 2000)?),
            self_signed_tls: env_parsed("SELF_SIGNED_TLS", false)?,
            pprof_enabled: env_parsed("PPROF_ENABLED", false)?,
        };

        if cfg.storage == StorageKind::Postgres {
            anyhow::bail!(
                "STORAGE=postgres selects the legacy SQL-persisted engine, which this build \
                 does not implement (out of scope per spec §1); run against memory or a \
                 valkey/redis backend instead"
            );
        }

        Ok(cfg)
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        None => Ok(default),
    }
}

fn parse_storage(raw: &str) -> anyhow::Result<StorageKind> {
    match raw {
        "memory" => Ok(StorageKind::Memory),
        "valkey" => Ok(StorageKind::Valkey),
        "redis" => Ok(StorageKind::Redis),
        "clustered-valkey" => Ok(StorageKind::ClusteredValkey),
        "clustered-redis" => Ok(StorageKind::ClusteredRedis),
        "postgres" => Ok(StorageKind::Postgres),
        other => anyhow::bail!("unknown STORAGE value: {other}"),
    }
}

fn parse_cidr_list(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<IpNet>().map_err(|e| anyhow::anyhow!("invalid CIDR {s}: {e}")))
        .collect()
}

/// Used by the real-IP extractor to check a single address against the
/// configured trust list.
pub fn is_trusted(ranges: &[IpNet], addr: IpAddr) -> bool {
    ranges.iter().any(|r| r.contains(&addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_trust_list_trusts_everything() {
        let ranges = vec!["0.0.0.0/0".parse().unwrap(), "::/0".parse().unwrap()];
        assert!(is_trusted(&ranges, "203.0.113.9".parse().unwrap()));
        assert!(is_trusted(&ranges, "::1".parse().unwrap()));
    }

    #[test]
    fn narrow_trust_list_excludes_outsiders() {
        let ranges = vec!["10.0.0.0/8".parse().unwrap()];
        assert!(is_trusted(&ranges, "10.1.2.3".parse().unwrap()));
        assert!(!is_trusted(&ranges, "203.0.113.9".parse().unwrap()));
    }
}
