use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::Method;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod analytics;
mod api;
mod backoff;
mod cache;
mod config;
mod crypto;
mod error;
mod ids;
mod limiter;
mod realip;
mod session;
mod storage;
mod verify;

use api::AppState;
use cache::{MarkedSet, MessageCache, NoopMessageCache};
use config::{Config, StorageKind};
use ids::EventIdGenerator;
use limiter::{BypassTokens, ConnectionLimiter, RpsLimiter};
use storage::Storage;
use verify::ConnectVerifyCache;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tc_bridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    if config.self_signed_tls {
        anyhow::bail!("SELF_SIGNED_TLS=true is not supported by this build; terminate TLS at a load balancer instead");
    }
    if config.pprof_enabled {
        tracing::warn!("PPROF_ENABLED=true but this build has no profiling endpoint; ignoring");
    }

    let verify_cache = Arc::new(ConnectVerifyCache::new(config.connect_cache_size, config.connect_cache_ttl));
    verify_cache.spawn_sweeper(config.connect_cache_ttl);

    let expired_cache: Arc<dyn MessageCache> = if config.enable_expired_cache {
        let set = Arc::new(MarkedSet::expired_cache());
        set.spawn_sweeper(std::time::Duration::from_secs(60));
        set
    } else {
        Arc::new(NoopMessageCache)
    };
    let transferred_cache: Arc<dyn MessageCache> = if config.enable_transferred_cache {
        let set = Arc::new(MarkedSet::transferred_cache());
        set.spawn_sweeper(std::time::Duration::from_secs(15));
        set
    } else {
        Arc::new(NoopMessageCache)
    };

    let analytics = config
        .analytics_url
        .clone()
        .map(|url| analytics::AnalyticsCollector::spawn(Some(url)));
    let sinks = Arc::new(analytics::ExternalSinks::new(config.webhook_urls.clone(), config.copy_to_url.clone()));

    let ids_generator: Arc<EventIdGenerator> = if config.ntp_enabled {
        let clock = ids::sntp::SntpClock::spawn(config.ntp_servers.clone(), config.ntp_sync_interval, config.ntp_query_timeout);
        Arc::new(EventIdGenerator::new(Arc::new(clock)))
    } else {
        Arc::new(EventIdGenerator::with_local_clock())
    };

    let storage: Arc<dyn Storage> = build_storage(&config, expired_cache.clone(), verify_cache.clone(), analytics.clone()).await?;

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        storage,
        ids: ids_generator,
        expired_cache,
        transferred_cache,
        verify_cache,
        connections: Arc::new(ConnectionLimiter::new(config.connections_limit)),
        rps: Arc::new(RpsLimiter::new(config.rps_limit)),
        bypass_tokens: Arc::new(BypassTokens::new(config.rate_limit_bypass_tokens.clone())),
        analytics,
        sinks,
        trusted_proxy_ranges: Arc::new(config.trusted_proxy_ranges.clone()),
        config: Arc::new(config.clone()),
        metrics_handle: prometheus,
    };

    let bridge_app = Router::new()
        .merge(api::routes::bridge_routes())
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(maybe_cors(config.cors_enable));

    let ops_app = Router::new().merge(api::routes::ops_routes()).with_state(state);

    let bridge_addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let ops_addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;

    tracing::info!(%bridge_addr, %ops_addr, "starting bridge");

    let bridge_listener = tokio::net::TcpListener::bind(bridge_addr).await?;
    let ops_listener = tokio::net::TcpListener::bind(ops_addr).await?;

    let bridge_server = axum::serve(bridge_listener, bridge_app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());
    let ops_server = axum::serve(ops_listener, ops_app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(bridge_server, ops_server)?;

    tracing::info!("bridge shutdown complete");
    Ok(())
}

async fn build_storage(
    config: &Config,
    expired_cache: Arc<dyn MessageCache>,
    verify_cache: Arc<ConnectVerifyCache>,
    analytics: Option<analytics::AnalyticsHandle>,
) -> Result<Arc<dyn Storage>> {
    match config.storage {
        StorageKind::Memory => {
            let mem = storage::memory::MemoryStorage::new(expired_cache, verify_cache, analytics);
            mem.spawn_watcher();
            Ok(mem)
        }
        StorageKind::Valkey | StorageKind::Redis => Ok(storage::valkey::ValkeyStorage::connect(&config.backend_uri).await?),
        StorageKind::ClusteredValkey | StorageKind::ClusteredRedis => {
            let urls: Vec<String> = config.backend_uri.split(',').map(|s| s.trim().to_string()).collect();
            Ok(storage::cluster::ClusterStorage::connect(urls, config.cluster_pubsub_mode).await?)
        }
        StorageKind::Postgres => unreachable!("Config::from_env rejects STORAGE=postgres before this point"),
    }
}

fn maybe_cors(enabled: bool) -> CorsLayer {
    if enabled {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any)
    } else {
        CorsLayer::new()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl+c, starting graceful shutdown"),
        _ = terminate => tracing::info!("received sigterm, starting graceful shutdown"),
    }
}
