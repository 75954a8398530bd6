//! # Configuration Module
//!
//! Two kinds of configuration live here:
//!
//! - [`RoutingConfig`] is the hot-reloaded routing snapshot: service name → endpoints and
//!   load balancer. It is parsed from YAML (or JSON, by file extension) every time the
//!   file changes.
//! - [`GatewaySettings`] are process settings read once at startup from command line flags,
//!   each with a `GATEWAY_*` environment variable fallback.
//!
//! ## Key Features
//! - Load balancer names are resolved when the snapshot is parsed; an unknown name is
//!   kept as [`StrategySpec::Unsupported`] so it can be rejected for that one service
//!   without failing the whole snapshot
//! - Blank endpoints are dropped and duplicate endpoints collapsed at parse time
//! - Settings validation with descriptive error messages

use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::StrategyKind;

/// Routing snapshot delivered by the config source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Service name → service definition
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// One declared service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Backend addresses (`host:port` or full URLs), in round-robin order
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Load balancer name; defaults to round-robin when omitted
    #[serde(default)]
    pub load_balancer: StrategySpec,
}

/// A load balancer name resolved at parse time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategySpec {
    Known(StrategyKind),
    Unsupported(String),
}

impl Default for StrategySpec {
    fn default() -> Self {
        StrategySpec::Known(StrategyKind::RoundRobin)
    }
}

impl StrategySpec {
    pub fn parse(name: &str) -> Self {
        match name.parse::<StrategyKind>() {
            Ok(kind) => StrategySpec::Known(kind),
            Err(_) => StrategySpec::Unsupported(name.to_string()),
        }
    }

    /// Resolve for a given service, rejecting unsupported names
    pub fn resolve(&self, service: &str) -> GatewayResult<StrategyKind> {
        match self {
            StrategySpec::Known(kind) => Ok(*kind),
            StrategySpec::Unsupported(name) => Err(GatewayError::unsupported_strategy(service, name)),
        }
    }
}

impl<'de> Deserialize<'de> for StrategySpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(StrategySpec::parse(&name))
    }
}

impl Serialize for StrategySpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            StrategySpec::Known(kind) => serializer.serialize_str(kind.as_str()),
            StrategySpec::Unsupported(name) => serializer.serialize_str(name),
        }
    }
}

/// Document format of a routing config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// JSON for a `.json` extension, YAML otherwise
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl RoutingConfig {
    /// Parse a snapshot from raw file content
    pub fn parse(content: &str, format: ConfigFormat) -> GatewayResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: RoutingConfig = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Json => serde_json::from_str(content)?,
        };

        Ok(config.normalized())
    }

    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        Self::parse(content, ConfigFormat::Yaml)
    }

    pub fn from_json_str(content: &str) -> GatewayResult<Self> {
        Self::parse(content, ConfigFormat::Json)
    }

    /// Read and parse a routing config file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| GatewayError::Io {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;
        Self::parse(&content, ConfigFormat::from_path(path))
    }

    /// Drop blank names and endpoints, collapse duplicate endpoints
    fn normalized(mut self) -> Self {
        self.services.retain(|name, _| {
            let keep = !name.trim().is_empty();
            if !keep {
                warn!("Ignoring service with a blank name");
            }
            keep
        });

        for (name, service) in self.services.iter_mut() {
            let declared = service.endpoints.len();
            let mut endpoints: Vec<String> = Vec::with_capacity(declared);
            for endpoint in service.endpoints.drain(..) {
                let endpoint = endpoint.trim().to_string();
                if endpoint.is_empty() || endpoints.contains(&endpoint) {
                    continue;
                }
                endpoints.push(endpoint);
            }
            if endpoints.len() != declared {
                warn!(
                    service = %name,
                    declared = declared,
                    kept = endpoints.len(),
                    "Dropped blank or duplicate endpoints"
                );
            }
            service.endpoints = endpoints;
        }

        self
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// How the routing config file is re-read
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReloadModeArg {
    /// File system change notifications
    Watch,
    /// Fixed-interval re-read
    Poll,
}

/// Resolved reload strategy for the config source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    Watch,
    Poll(Duration),
}

/// Kubernetes discovery settings
#[derive(Debug, Clone, Args)]
pub struct KubernetesSettings {
    /// Reconcile services and pods from the cluster
    #[arg(long = "kubernetes", env = "GATEWAY_KUBERNETES_ENABLED")]
    pub enabled: bool,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long = "kube-namespace", env = "GATEWAY_KUBERNETES_NAMESPACE")]
    pub namespace: Option<String>,

    /// Kubeconfig path (in-cluster or default inference when unset)
    #[arg(long = "kubeconfig", env = "GATEWAY_KUBECONFIG")]
    pub kubeconfig_path: Option<PathBuf>,

    /// Pod port used when a service has no numeric target port
    #[arg(long = "kube-default-port", env = "GATEWAY_KUBERNETES_DEFAULT_PORT", default_value_t = 80)]
    pub default_port: u16,

    /// Load balancer for pools created from cluster services
    #[arg(long = "kube-strategy", env = "GATEWAY_KUBERNETES_STRATEGY", default_value = "round-robin")]
    pub strategy: StrategyKind,

    /// Delay before resubscribing after a watch stream error
    #[arg(
        long = "kube-resubscribe-backoff",
        env = "GATEWAY_KUBERNETES_RESUBSCRIBE_BACKOFF",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub resubscribe_backoff: Duration,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: None,
            kubeconfig_path: None,
            default_port: 80,
            strategy: StrategyKind::RoundRobin,
            resubscribe_backoff: Duration::from_secs(5),
        }
    }
}

/// Process settings
#[derive(Debug, Clone, Parser)]
#[command(name = "discovery-gateway", version, about)]
pub struct GatewaySettings {
    /// Routing config file (YAML, or JSON with a .json extension)
    #[arg(long = "config", env = "GATEWAY_CONFIG_PATH", default_value = "config/gateway.yaml")]
    pub config_path: PathBuf,

    /// Address the proxy listens on
    #[arg(long = "listen", env = "GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// How config changes are detected
    #[arg(long = "reload-mode", env = "GATEWAY_RELOAD_MODE", value_enum, default_value_t = ReloadModeArg::Watch)]
    pub reload_mode: ReloadModeArg,

    /// Re-read interval in poll mode
    #[arg(
        long = "poll-interval",
        env = "GATEWAY_POLL_INTERVAL",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub poll_interval: Duration,

    /// Timeout for a proxied upstream request
    #[arg(
        long = "upstream-timeout",
        env = "GATEWAY_UPSTREAM_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub upstream_timeout: Duration,

    /// Prometheus exporter address (disabled when unset)
    #[arg(long = "metrics-addr", env = "GATEWAY_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Default log level; RUST_LOG takes precedence
    #[arg(long = "log-level", env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long = "log-format", env = "GATEWAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub kubernetes: KubernetesSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/gateway.yaml"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            reload_mode: ReloadModeArg::Watch,
            poll_interval: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(30),
            metrics_addr: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            kubernetes: KubernetesSettings::default(),
        }
    }
}

impl GatewaySettings {
    pub fn reload_mode(&self) -> ReloadMode {
        match self.reload_mode {
            ReloadModeArg::Watch => ReloadMode::Watch,
            ReloadModeArg::Poll => ReloadMode::Poll(self.poll_interval),
        }
    }

    /// Validate settings that clap cannot check on its own
    pub fn validate(&self) -> GatewayResult<()> {
        if self.config_path.as_os_str().is_empty() {
            return Err(GatewayError::config("Config path cannot be empty"));
        }

        if self.config_path.file_name().is_none() {
            return Err(GatewayError::config(format!(
                "Config path {} does not name a file",
                self.config_path.display()
            )));
        }

        if self.reload_mode == ReloadModeArg::Poll && self.poll_interval.is_zero() {
            return Err(GatewayError::config("Poll interval must be greater than 0"));
        }

        if self.upstream_timeout.is_zero() {
            return Err(GatewayError::config("Upstream timeout must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(GatewayError::config(format!(
                "Invalid log level: {}. Valid levels are: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.kubernetes.enabled {
            if self.kubernetes.default_port == 0 {
                return Err(GatewayError::config("Kubernetes default port cannot be 0"));
            }
            if self.kubernetes.resubscribe_backoff.is_zero() {
                return Err(GatewayError::config(
                    "Kubernetes resubscribe backoff must be greater than 0",
                ));
            }
            if let Some(namespace) = &self.kubernetes.namespace {
                if namespace.trim().is_empty() {
                    return Err(GatewayError::config("Kubernetes namespace cannot be blank"));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    #[test]
    fn test_parse_yaml_snapshot() {
        let config = RoutingConfig::from_yaml_str(
            r#"
services:
  service1:
    endpoints:
      - http://localhost:8081
      - http://localhost:8082
    loadBalancer: round-robin
  service2:
    endpoints: ["10.0.0.1:80"]
    loadBalancer: least-connections
"#,
        )
        .unwrap();

        assert_eq!(config.services.len(), 2);
        let service1 = &config.services["service1"];
        assert_eq!(service1.endpoints.len(), 2);
        assert_eq!(service1.load_balancer, StrategySpec::Known(StrategyKind::RoundRobin));
        assert_eq!(
            config.services["service2"].load_balancer,
            StrategySpec::Known(StrategyKind::LeastConnections)
        );
    }

    #[test]
    fn test_unknown_strategy_does_not_fail_snapshot() {
        let config = RoutingConfig::from_yaml_str(
            r#"
services:
  good:
    endpoints: ["a:80"]
  bad:
    endpoints: ["b:80"]
    loadBalancer: random
"#,
        )
        .unwrap();

        assert_eq!(
            config.services["good"].load_balancer.resolve("good"),
            Ok(StrategyKind::RoundRobin)
        );
        assert_eq!(
            config.services["bad"].load_balancer.resolve("bad"),
            Err(GatewayError::unsupported_strategy("bad", "random"))
        );
    }

    #[test]
    fn test_malformed_snapshot_is_parse_error() {
        let err = RoutingConfig::from_yaml_str("invalid_yaml").unwrap_err();
        assert_eq!(err.error_type(), "config_parse_error");

        let err = RoutingConfig::from_yaml_str("services: [1, 2").unwrap_err();
        assert_eq!(err.error_type(), "config_parse_error");
    }

    #[test]
    fn test_empty_document_is_empty_snapshot() {
        assert_eq!(RoutingConfig::from_yaml_str("  \n").unwrap(), RoutingConfig::default());
        assert!(RoutingConfig::from_yaml_str("services: {}").unwrap().services.is_empty());
    }

    #[test]
    fn test_endpoints_are_normalized() {
        let config = RoutingConfig::from_yaml_str(
            r#"
services:
  api:
    endpoints: ["a:80", " ", "b:80", "a:80"]
  "":
    endpoints: ["c:80"]
"#,
        )
        .unwrap();

        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services["api"].endpoints, vec!["a:80", "b:80"]);
    }

    #[test]
    fn test_parse_json_snapshot() {
        let config = RoutingConfig::from_json_str(
            r#"{"services": {"api": {"endpoints": ["a:80"], "loadBalancer": "least-connections"}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.services["api"].load_balancer,
            StrategySpec::Known(StrategyKind::LeastConnections)
        );
    }

    #[tokio::test]
    async fn test_load_from_file_uses_extension() {
        let temp_dir = TempDir::new().unwrap();
        let json_path = temp_dir.path().join("routes.json");
        fs::write(&json_path, r#"{"services": {"api": {"endpoints": ["a:80"]}}}"#)
            .await
            .unwrap();

        let config = RoutingConfig::load_from_file(&json_path).await.unwrap();
        assert_eq!(config.services["api"].endpoints, vec!["a:80"]);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = RoutingConfig::load_from_file(temp_dir.path().join("missing.yaml"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "io_error");
    }

    #[test]
    fn test_settings_from_args() {
        let settings = GatewaySettings::try_parse_from([
            "discovery-gateway",
            "--config",
            "/etc/gateway/routes.yaml",
            "--listen",
            "127.0.0.1:9000",
            "--reload-mode",
            "poll",
            "--poll-interval",
            "2s",
            "--kubernetes",
            "--kube-strategy",
            "least-connections",
        ])
        .unwrap();

        assert_eq!(settings.config_path, PathBuf::from("/etc/gateway/routes.yaml"));
        assert_eq!(settings.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(settings.reload_mode(), ReloadMode::Poll(Duration::from_secs(2)));
        assert!(settings.kubernetes.enabled);
        assert_eq!(settings.kubernetes.strategy, StrategyKind::LeastConnections);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation_errors() {
        let mut settings = GatewaySettings::default();
        assert!(settings.validate().is_ok());

        settings.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
        settings.log_level = "debug".to_string();

        settings.reload_mode = ReloadModeArg::Poll;
        settings.poll_interval = Duration::ZERO;
        assert!(settings.validate().is_err());
        settings.poll_interval = Duration::from_secs(1);

        settings.kubernetes.enabled = true;
        settings.kubernetes.default_port = 0;
        assert!(settings.validate().is_err());
        settings.kubernetes.default_port = 8080;

        settings.kubernetes.namespace = Some("  ".to_string());
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("namespace"));
    }
}
