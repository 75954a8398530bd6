// Structured logging
pub mod logging;

// Metrics facade and Prometheus exporter
pub mod metrics;

pub use self::logging::init_logging;
pub use self::metrics::install_prometheus_exporter;
