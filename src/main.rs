//! Query Dispatch - Main entry point.
//!
//! Serves `POST /api/queries/execute` and `GET /health` over HTTP.

use query_dispatch::config::Config;
use query_dispatch::db::{BackendConnector, ConnectionPool, PoolSettings};
use query_dispatch::dispatcher::{DispatchSettings, Dispatcher};
use query_dispatch::transport::{HttpTransport, Transport};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();

    init_tracing(&config);

    if let Err(message) = config.validate() {
        eprintln!("Error: {}", message);
        std::process::exit(1);
    }

    info!(
        addr = %config.bind_addr(),
        query_timeout_secs = config.query_timeout,
        pool_ttl_secs = config.pool_ttl,
        cors_any_origin = config.allows_any_origin(),
        "Starting query dispatch v{}",
        env!("CARGO_PKG_VERSION")
    );

    let connector = BackendConnector::from_config(&config)?;
    let pool = ConnectionPool::new(connector, PoolSettings::from_config(&config));
    let dispatcher = Arc::new(Dispatcher::new(pool, DispatchSettings::from_config(&config)));

    let transport = HttpTransport::new(
        dispatcher,
        config.host.clone(),
        config.port,
        config.cors_origins.clone(),
    );

    if let Err(e) = transport.run().await {
        error!(error = %e, transport = transport.name(), "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
