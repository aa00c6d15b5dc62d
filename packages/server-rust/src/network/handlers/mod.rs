//! HTTP handlers for the health and admin surface.

pub mod health;

pub use health::{cache_health_handler, health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;

use tokio::time::Instant;

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::cache::ResilientCache;

/// Shared state passed to handlers via `State` extraction. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: Arc<ShutdownController>,
    pub cache: Arc<ResilientCache>,
    pub config: Arc<NetworkConfig>,
    /// Process start, for uptime.
    pub start_time: Instant,
}
