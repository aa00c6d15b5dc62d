//! tablefence server binary: health/admin surface plus startup checks for
//! the tenant pool and cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tablefence_server::cache::{BreakerConfig, CacheConfig, CacheMode, ResilientCache};
use tablefence_server::db::VariableScoping;
use tablefence_server::network::{AdmissionConfig, NetworkConfig, NetworkModule};
use tablefence_server::telemetry::{self, LogFormat};
use tablefence_server::{DatabaseConfig, Environment, ServerConfig};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tablefence", version, about = "Tenant isolation and fail-closed cache service")]
struct Cli {
    /// Deployment environment (production, staging, development, test).
    #[arg(long, env = "TABLEFENCE_ENV", default_value = "production")]
    environment: Environment,

    /// Comma-separated platform-owner email allow-list.
    #[arg(long, env = "TABLEFENCE_PLATFORM_OWNERS", value_delimiter = ',')]
    platform_owners: Vec<String>,

    #[arg(long, env = "TABLEFENCE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "TABLEFENCE_PORT", default_value_t = 8080)]
    port: u16,

    /// Log format (pretty or json).
    #[arg(long, env = "TABLEFENCE_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, env = "TABLEFENCE_LOG", default_value = "info,tablefence=info")]
    log_filter: String,

    /// Address for the Prometheus scrape endpoint.
    #[arg(long, env = "TABLEFENCE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Cache backend URL (e.g. redis://127.0.0.1:6379).
    #[arg(long, env = "TABLEFENCE_CACHE_URL")]
    cache_url: Option<String>,

    /// Use the in-process permissive cache. Refused in production.
    #[arg(long, env = "TABLEFENCE_CACHE_PERMISSIVE")]
    cache_permissive: bool,

    #[arg(long, env = "TABLEFENCE_CACHE_TIMEOUT_MS", default_value_t = 500)]
    cache_timeout_ms: u64,

    #[arg(long, env = "TABLEFENCE_BREAKER_FAILURES", default_value_t = 5)]
    breaker_failures: u32,

    #[arg(long, env = "TABLEFENCE_BREAKER_SUCCESSES", default_value_t = 2)]
    breaker_successes: u32,

    #[arg(long, env = "TABLEFENCE_BREAKER_OPEN_SECS", default_value_t = 30)]
    breaker_open_secs: u64,

    /// Postgres URL for the tenant pool.
    #[arg(long, env = "TABLEFENCE_DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "TABLEFENCE_DATABASE_POOL_SIZE", default_value_t = 10)]
    database_pool_size: usize,

    /// Use connection-scoped variables with itemized reset instead of
    /// transaction-local ones.
    #[arg(long, env = "TABLEFENCE_CONNECTION_SCOPED_VARIABLES")]
    connection_scoped_variables: bool,

    #[arg(long, env = "TABLEFENCE_MAX_CONNECTIONS_PER_USER", default_value_t = 10)]
    max_connections_per_user: usize,

    #[arg(long, env = "TABLEFENCE_CONNECTION_RATE", default_value_t = 30)]
    connection_rate: u64,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            environment: self.environment,
            platform_owner_emails: self.platform_owners,
            log_format: self.log_format,
            metrics_addr: self.metrics_addr,
            network: NetworkConfig {
                host: self.host,
                port: self.port,
                ..NetworkConfig::default()
            },
            admission: AdmissionConfig {
                max_connections_per_identity: self.max_connections_per_user,
                connection_rate_limit: self.connection_rate,
                ..AdmissionConfig::default()
            },
            cache: CacheConfig {
                mode: if self.cache_permissive {
                    CacheMode::Permissive
                } else {
                    CacheMode::Production
                },
                url: self.cache_url,
                operation_timeout: Duration::from_millis(self.cache_timeout_ms),
                breaker: BreakerConfig {
                    failure_threshold: self.breaker_failures,
                    success_threshold: self.breaker_successes,
                    open_timeout: Duration::from_secs(self.breaker_open_secs),
                    ..BreakerConfig::default()
                },
                ..CacheConfig::default()
            },
            database: DatabaseConfig {
                url: self.database_url,
                pool_size: self.database_pool_size,
                scoping: if self.connection_scoped_variables {
                    VariableScoping::ConnectionOnly
                } else {
                    VariableScoping::TransactionLocal
                },
                ..DatabaseConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_filter = cli.log_filter.clone();
    let config = cli.into_config();
    telemetry::init(config.log_format, &log_filter)?;

    config.validate().context("invalid configuration")?;
    info!(
        environment = %config.environment,
        platform_owners = config.platform_owner_policy().len(),
        "starting tablefence"
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let cache = Arc::new(
        ResilientCache::connect(config.cache.clone(), config.environment)
            .await
            .context("connecting cache")?,
    );
    check_database(&config.database).await?;

    let mut network = NetworkModule::new(config.network.clone(), cache);
    let port = network.start().await?;
    info!(port, "tablefence ready");
    network.serve(shutdown_signal()).await
}

#[cfg(feature = "postgres")]
async fn check_database(config: &DatabaseConfig) -> anyhow::Result<()> {
    use tablefence_server::context::ContextCarrier;
    use tablefence_server::db::{postgres, SessionVariableBinder, TenantRequirement};

    let Some(url) = config.url.as_deref() else {
        warn!("no database url configured; tenant pool not started");
        return Ok(());
    };
    let pool = postgres::connect_pool(url, config.pool_size, SessionVariableBinder::new(config.scoping))
        .await
        .context("connecting tenant pool")?;
    let carrier = ContextCarrier::with_cancellation(
        tokio_util::sync::CancellationToken::new(),
        config.operation_budget.map(|budget| tokio::time::Instant::now() + budget),
    );
    let tx = pool.begin(&carrier, TenantRequirement::Unscoped).await?;
    tx.commit().await?;
    info!(size = pool.size(), "tenant pool verified");
    Ok(())
}

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)]
async fn check_database(config: &DatabaseConfig) -> anyhow::Result<()> {
    if config.url.is_some() {
        anyhow::bail!("database url configured but this build lacks the `postgres` feature");
    }
    warn!("no database url configured; tenant pool not started");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
