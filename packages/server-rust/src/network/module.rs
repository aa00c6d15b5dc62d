//! HTTP surface with deferred startup: `new()` allocates shared state,
//! `start()` binds, `serve()` runs until the shutdown future resolves.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    cache_health_handler, health_handler, liveness_handler, readiness_handler, AppState,
};
use super::middleware::with_http_layers;
use super::registry::ConnectionRegistry;
use super::shutdown::ShutdownController;
use crate::cache::ResilientCache;

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    cache: Arc<ResilientCache>,
}

impl NetworkModule {
    /// Allocates the registry and shutdown controller without binding, so
    /// they can be shared with the rest of the application first.
    #[must_use]
    pub fn new(config: NetworkConfig, cache: Arc<ResilientCache>) -> Self {
        Self {
            config,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            cache,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Routes:
    /// - `GET /health`: detailed health JSON
    /// - `GET /health/live`: liveness probe
    /// - `GET /health/ready`: readiness probe
    /// - `GET /health/cache`: circuit breaker state
    pub fn build_router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            cache: Arc::clone(&self.cache),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };
        let router = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/health/cache", get(cache_health_handler));
        with_http_layers(router, &self.config).with_state(state)
    }

    /// Binds the listener and returns the bound port (OS-assigned when 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then cancels operations, clears the
    /// registry and waits for in-flight work to drain.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();

        self.shutdown.set_ready();
        info!("serving HTTP");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        self.shutdown.trigger_shutdown();
        let dropped = self.registry.drain_all().len();
        if dropped > 0 {
            info!(dropped, "connection registry cleared");
        }
        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight operations drained");
        } else {
            warn!(
                remaining = self.shutdown.in_flight_count(),
                "drain timeout expired"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    fn module() -> NetworkModule {
        NetworkModule::new(
            NetworkConfig::default(),
            Arc::new(ResilientCache::permissive(CacheConfig::default())),
        )
    }

    #[test]
    fn new_does_not_bind() {
        assert!(module().listener.is_none());
    }

    #[test]
    fn shared_handles_are_the_same_instance() {
        let module = module();
        assert!(Arc::ptr_eq(&module.registry(), &module.registry()));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[test]
    fn router_builds() {
        let _router = module().build_router();
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let mut module = module();
        let port = module.start().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module().serve(async {}).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_drains_on_shutdown() {
        let mut module = module();
        module.start().await.unwrap();
        let shutdown = module.shutdown_controller();
        module.serve(async {}).await.unwrap();
        assert_eq!(shutdown.health_state(), crate::network::HealthState::Stopped);
    }
}
