//! Per-IP connection limiter and global RPS token bucket for
//! `/bridge/message`, plus the bearer-token bypass shared by both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::BridgeError;

/// Maps `"ip-"+ip -> in_flight_count` behind a single lock.
pub struct ConnectionLimiter {
    max: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl ConnectionLimiter {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Lease a connection slot for `ip`. The returned `ConnectionLease` must
    /// be held for the lifetime of the streaming request; dropping it (or
    /// calling `release()` explicitly) frees the slot. Releasing twice is
    /// safe and a no-op the second time.
    pub fn lease(self: &Arc<Self>, ip: &str) -> Result<ConnectionLease, BridgeError> {
        let key = format!("ip-{ip}");
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key.clone()).or_insert(0);
        if *count >= self.max {
            return Err(BridgeError::ConnectionLimited);
        }
        *count += 1;
        drop(counts);
        metrics::counter!("bridge_connections_leased_total").increment(1);

        Ok(ConnectionLease {
            limiter: self.clone(),
            key,
            released: AtomicBool::new(false),
        })
    }

    fn release(&self, key: &str) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(key);
            }
        }
        drop(counts);
        metrics::counter!("bridge_connections_released_total").increment(1);
    }

    #[cfg(test)]
    fn in_flight(&self, ip: &str) -> u32 {
        let key = format!("ip-{ip}");
        *self.counts.lock().unwrap().get(&key).unwrap_or(&0)
    }
}

pub struct ConnectionLease {
    limiter: Arc<ConnectionLimiter>,
    key: String,
    released: AtomicBool,
}

impl ConnectionLease {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.limiter.release(&self.key);
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Fixed-window global token bucket guarding `/bridge/message`: `RPS_LIMIT`
/// tokens refill once per second.
pub struct RpsLimiter {
    max_per_second: u32,
    state: Mutex<(Instant, u32)>,
}

impl RpsLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn check(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap();
        let (window_start, used) = &mut *state;

        if window_start.elapsed() >= Duration::from_secs(1) {
            *window_start = Instant::now();
            *used = 0;
        }

        if *used >= self.max_per_second {
            metrics::counter!("bridge_rate_limit_rejections_total").increment(1);
            return Err(BridgeError::RateLimited);
        }

        *used += 1;
        Ok(())
    }
}

/// Bearer-token rate-limit bypass list.
#[derive(Default)]
pub struct BypassTokens {
    tokens: Vec<String>,
}

impl BypassTokens {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Returns `true` and records a bypass hit if `header_value` (the raw
    /// `Authorization` header) carries a matching bearer token.
    pub fn check(&self, header_value: Option<&str>) -> bool {
        let Some(token) = header_value.and_then(|h| h.strip_prefix("Bearer ")) else {
            return false;
        };
        if !self.tokens.iter().any(|t| t == token) {
            return false;
        }
        metrics::counter!("bridge_rate_limit_bypass_total").increment(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_blocks_once_max_reached() {
        let limiter = Arc::new(ConnectionLimiter::new(2));
        let a = limiter.lease("1.2.3.4").unwrap();
        let b = limiter.lease("1.2.3.4").unwrap();
        assert!(limiter.lease("1.2.3.4").is_err());
        assert_eq!(limiter.in_flight("1.2.3.4"), 2);
        drop(a);
        assert_eq!(limiter.in_flight("1.2.3.4"), 1);
        let c = limiter.lease("1.2.3.4").unwrap();
        drop(b);
        drop(c);
        assert_eq!(limiter.in_flight("1.2.3.4"), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let limiter = Arc::new(ConnectionLimiter::new(1));
        let lease = limiter.lease("9.9.9.9").unwrap();
        lease.release();
        lease.release();
        assert_eq!(limiter.in_flight("9.9.9.9"), 0);
    }

    #[test]
    fn different_ips_have_independent_budgets() {
        let limiter = Arc::new(ConnectionLimiter::new(1));
        let _a = limiter.lease("1.1.1.1").unwrap();
        assert!(limiter.lease("2.2.2.2").is_ok());
    }

    #[test]
    fn rps_limiter_allows_up_to_max_per_window() {
        let limiter = RpsLimiter::new(2);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn bypass_token_matches_configured_list() {
        let bypass = BypassTokens::new(vec!["secret".to_string()]);
        assert!(bypass.check(Some("Bearer secret")));
        assert!(!bypass.check(Some("Bearer wrong")));
        assert!(!bypass.check(None));
    }
}
