//! HTTP surface. `AppState` holds the bridge's storage handle and
//! collaborators, shared across every handler.

pub mod events;
pub mod health;
pub mod message;
pub mod routes;
pub mod verify;

use std::sync::Arc;

use ipnet::IpNet;

use crate::analytics::{AnalyticsHandle, ExternalSinks};
use crate::cache::MessageCache;
use crate::config::Config;
use crate::ids::EventIdGenerator;
use crate::limiter::{BypassTokens, ConnectionLimiter, RpsLimiter};
use crate::storage::Storage;
use crate::verify::ConnectVerifyCache;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub ids: Arc<EventIdGenerator>,
    pub expired_cache: Arc<dyn MessageCache>,
    pub transferred_cache: Arc<dyn MessageCache>,
    pub verify_cache: Arc<ConnectVerifyCache>,
    pub connections: Arc<ConnectionLimiter>,
    pub rps: Arc<RpsLimiter>,
    pub bypass_tokens: Arc<BypassTokens>,
    pub analytics: Option<AnalyticsHandle>,
    pub sinks: Arc<ExternalSinks>,
    pub trusted_proxy_ranges: Arc<Vec<IpNet>>,
    pub config: Arc<Config>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}
