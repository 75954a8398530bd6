//! # Metrics
//!
//! Components record through the `metrics` facade macros; nothing is collected until a
//! recorder is installed. [`install_prometheus_exporter`] installs the Prometheus recorder
//! and serves the scrape endpoint on its own listener.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
///
/// Must be called from inside a tokio runtime.
pub fn install_prometheus_exporter(addr: SocketAddr) -> GatewayResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", env!("CARGO_PKG_NAME"))
        .install()
        .map_err(|e| GatewayError::config(format!("Failed to install Prometheus exporter: {}", e)))?;

    describe_metrics();
    info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Register help text for every metric the gateway emits
pub fn describe_metrics() {
    describe_counter!("gateway_selections_total", "Successful endpoint selections by strategy");
    describe_counter!(
        "gateway_failed_selections_total",
        "Selections that found no usable endpoint, by strategy"
    );
    describe_counter!("gateway_route_errors_total", "Failed routing decisions by error type");
    describe_gauge!("gateway_registered_services", "Services currently in the registry");
    describe_counter!("gateway_config_reloads_total", "Routing config reloads by outcome");
    describe_counter!(
        "gateway_config_rejected_services_total",
        "Service updates rejected for an unsupported load balancer"
    );
    describe_counter!("gateway_cluster_events_total", "Cluster topology events applied, by event");
    describe_gauge!("gateway_cluster_tracked_services", "Cluster services being tracked");
    describe_gauge!("gateway_cluster_serving_instances", "Known ready workload instances");
    describe_counter!("gateway_watch_stream_errors_total", "Watch stream failures by resource");
}
