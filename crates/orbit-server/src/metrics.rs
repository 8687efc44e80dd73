//! Metrics export for Orbit.
//!
//! The core records through the `metrics` facade; this module describes the
//! metrics and serves them in Prometheus format.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names recorded by the server itself.
pub mod names {
    pub const BUILD_INFO: &str = "orbit_build_info";
}

/// Describe every metric.
pub fn init_metrics() {
    orbit_core::metrics::describe();
    metrics::describe_gauge!(names::BUILD_INFO, "Orbit server version");
    metrics::gauge!(names::BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
