//! HTTP surface, connection registry, admission control and shutdown.

pub mod admission;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod registry;
pub mod shutdown;

pub use admission::AdmissionController;
pub use config::{AdmissionConfig, NetworkConfig};
pub use error::ApiError;
pub use handlers::AppState;
pub use module::NetworkModule;
pub use registry::{ConnectionId, ConnectionRegistry, RegistryEntry, RegistryError};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
