//! # Orbit Server
//!
//! Hosts the Orbit route set behind one lifecycle.
//!
//! ## Usage
//!
//! ```bash
//! # Run with the in-process transports
//! ORBIT_DOCUMENT_STORE__CONNECTION_STRING=memory://local orbit
//!
//! # Run with a config file
//! ORBIT_CONFIG=/path/to/orbit.toml orbit
//!
//! # Override single values
//! ORBIT_PORT=8080 ORBIT_BROKER__GROUP_ID=workers orbit
//! ```

mod config;
mod metrics;
mod routes;
mod signals;
mod transports;

use anyhow::Result;
use orbit_core::Orchestrator;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn run() -> Result<u8> {
    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Orbit server on {}:{}", config.host, config.port);

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let store = transports::document_store(&config.document_store)?;
    let broker = transports::broker(&config.broker)?;
    let registry = routes::registry()?;

    let code = Orchestrator::new(config.service_config()?, registry, store, broker)
        .run(signals::shutdown_signal())
        .await;
    Ok(code)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orbit=debug,orbit_core=debug,orbit_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
