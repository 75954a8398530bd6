//! # Config Reconciler
//!
//! Applies routing snapshots from the [`ConfigSource`](super::config_source::ConfigSource)
//! to the shared registry.
//!
//! Every snapshot is a sweep: declared services are replaced wholesale, services that
//! disappeared since the previous snapshot are removed. Each service transitions on its
//! own; the sweep as a whole is not atomic.
//!
//! Failures stay contained:
//!
//! - A malformed snapshot is logged and dropped. The last good routes stay live.
//! - A service naming an unknown load balancer is rejected on its own. If it was already
//!   registered it keeps serving its previous pool; otherwise it stays absent.
//! - Names containing `/` are rejected. That form is reserved for cluster `namespace/name`
//!   keys, whose pools the cluster reconciler maintains incrementally.

use metrics::counter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::RoutingConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::config_source::ConfigUpdate;
use crate::registry::ServiceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerState {
    /// Holding the last applied snapshot
    Idle,
    /// Sweeping a snapshot into the registry
    Applying,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub replaced: Vec<String>,
    pub removed: Vec<String>,
    pub rejected: Vec<(String, GatewayError)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

pub struct ConfigReconciler {
    registry: Arc<ServiceRegistry>,
    state: ReconcilerState,
    last_applied: Option<RoutingConfig>,
    /// Registry keys this reconciler is responsible for
    owned: BTreeSet<String>,
}

impl ConfigReconciler {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            state: ReconcilerState::Idle,
            last_applied: None,
            owned: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// The last snapshot that was swept into the registry
    pub fn last_applied(&self) -> Option<&RoutingConfig> {
        self.last_applied.as_ref()
    }

    /// Services currently owned by the config pipeline, sorted
    pub fn owned_services(&self) -> Vec<String> {
        self.owned.iter().cloned().collect()
    }

    /// Sweep a snapshot into the registry
    pub fn apply(&mut self, snapshot: RoutingConfig) -> ReconcileReport {
        self.state = ReconcilerState::Applying;
        let mut report = ReconcileReport::default();
        let mut next_owned = BTreeSet::new();

        for (name, service) in &snapshot.services {
            let resolved = if name.contains('/') {
                Err(GatewayError::config(format!(
                    "Service name '{}' contains '/', which is reserved for cluster services",
                    name
                )))
            } else {
                service.load_balancer.resolve(name)
            };
            match resolved {
                Ok(kind) => {
                    self.registry.replace(name, service.endpoints.iter().cloned(), kind);
                    next_owned.insert(name.clone());
                    report.replaced.push(name.clone());
                }
                Err(err) => {
                    let kept = self.owned.contains(name) && self.registry.contains(name);
                    warn!(
                        service = %name,
                        error = %err,
                        kept_previous = kept,
                        "Rejected service update"
                    );
                    if kept {
                        next_owned.insert(name.clone());
                    }
                    report.rejected.push((name.clone(), err));
                }
            }
        }

        for name in self.owned.difference(&next_owned) {
            if self.registry.remove(name) {
                report.removed.push(name.clone());
            }
        }

        self.owned = next_owned;
        self.last_applied = Some(snapshot);
        self.state = ReconcilerState::Idle;

        counter!("gateway_config_reloads_total", "outcome" => "applied").increment(1);
        if !report.rejected.is_empty() {
            counter!("gateway_config_rejected_services_total").increment(report.rejected.len() as u64);
        }
        info!(
            replaced = report.replaced.len(),
            removed = report.removed.len(),
            rejected = report.rejected.len(),
            "Applied routing configuration"
        );

        report
    }

    /// Apply a delivered update; a failed update leaves the live routes untouched
    pub fn apply_result(&mut self, update: GatewayResult<RoutingConfig>) -> Option<ReconcileReport> {
        match update {
            Ok(snapshot) => Some(self.apply(snapshot)),
            Err(err) => {
                counter!("gateway_config_reloads_total", "outcome" => "failed").increment(1);
                error!(
                    error = %err,
                    error_type = err.error_type(),
                    "Failed to reload configuration, keeping last good routes"
                );
                None
            }
        }
    }

    /// Apply updates until the channel closes or `shutdown` is cancelled
    pub async fn run(mut self, mut updates: mpsc::Receiver<ConfigUpdate>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => {
                        self.apply_result(update);
                    }
                    None => break,
                },
            }
        }
        debug!("Config reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancing::StrategyKind;

    fn snapshot(yaml: &str) -> RoutingConfig {
        RoutingConfig::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_apply_replaces_and_removes() {
        let registry = Arc::new(ServiceRegistry::new());
        let mut reconciler = ConfigReconciler::new(Arc::clone(&registry));

        let report = reconciler.apply(snapshot(
            r#"
services:
  api:
    endpoints: ["a:80", "b:80"]
  web:
    endpoints: ["w:80"]
    loadBalancer: least-connections
"#,
        ));
        assert_eq!(report.replaced, vec!["api", "web"]);
        assert!(report.is_clean());
        assert_eq!(registry.service_keys(), vec!["api", "web"]);
        assert_eq!(
            registry.snapshot("web").unwrap().strategy(),
            StrategyKind::LeastConnections
        );

        let report = reconciler.apply(snapshot(
            r#"
services:
  api:
    endpoints: ["c:80"]
"#,
        ));
        assert_eq!(report.removed, vec!["web"]);
        assert_eq!(registry.service_keys(), vec!["api"]);
        assert_eq!(registry.snapshot("api").unwrap().endpoints.as_slice(), &["c:80"]);
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
    }

    #[test]
    fn test_replace_resets_strategy_state() {
        let registry = Arc::new(ServiceRegistry::new());
        let mut reconciler = ConfigReconciler::new(Arc::clone(&registry));
        let yaml = r#"
services:
  api:
    endpoints: ["a:80", "b:80", "c:80"]
"#;

        reconciler.apply(snapshot(yaml));
        assert_eq!(registry.next_endpoint("api").unwrap(), "a:80");
        assert_eq!(registry.next_endpoint("api").unwrap(), "b:80");

        reconciler.apply(snapshot(yaml));
        assert_eq!(registry.next_endpoint("api").unwrap(), "a:80");
    }

    #[test]
    fn test_unsupported_strategy_is_isolated() {
        let registry = Arc::new(ServiceRegistry::new());
        let mut reconciler = ConfigReconciler::new(Arc::clone(&registry));

        reconciler.apply(snapshot(
            r#"
services:
  api:
    endpoints: ["a:80"]
"#,
        ));

        let report = reconciler.apply(snapshot(
            r#"
services:
  api:
    endpoints: ["b:80"]
    loadBalancer: weighted
  new:
    endpoints: ["n:80"]
    loadBalancer: weighted
  ok:
    endpoints: ["o:80"]
"#,
        ));

        assert_eq!(report.replaced, vec!["ok"]);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(
            report.rejected[0],
            ("api".to_string(), GatewayError::unsupported_strategy("api", "weighted"))
        );

        // Previously configured service keeps its old pool, new one stays absent
        assert_eq!(registry.snapshot("api").unwrap().endpoints.as_slice(), &["a:80"]);
        assert!(!registry.contains("new"));
        assert!(registry.contains("ok"));
        assert_eq!(reconciler.owned_services(), vec!["api", "ok"]);
    }

    #[test]
    fn test_parse_failure_keeps_last_good_snapshot() {
        let registry = Arc::new(ServiceRegistry::new());
        let mut reconciler = ConfigReconciler::new(Arc::clone(&registry));

        reconciler.apply(snapshot("services:\n  api:\n    endpoints: [\"a:80\"]\n"));
        let before = reconciler.last_applied().cloned();

        let outcome = reconciler.apply_result(Err(GatewayError::config_parse("bad yaml")));
        assert!(outcome.is_none());
        assert_eq!(reconciler.last_applied().cloned(), before);
        assert_eq!(registry.next_endpoint("api").unwrap(), "a:80");
    }

    #[test]
    fn test_only_owned_services_are_removed() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.ensure("default/orders", StrategyKind::RoundRobin);

        let mut reconciler = ConfigReconciler::new(Arc::clone(&registry));
        reconciler.apply(snapshot("services:\n  api:\n    endpoints: [\"a:80\"]\n"));
        let report = reconciler.apply(RoutingConfig::default());

        assert_eq!(report.removed, vec!["api"]);
        assert_eq!(registry.service_keys(), vec!["default/orders"]);
    }

    #[tokio::test]
    async fn test_run_applies_until_channel_closes() {
        let registry = Arc::new(ServiceRegistry::new());
        let reconciler = ConfigReconciler::new(Arc::clone(&registry));
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(reconciler.run(rx, CancellationToken::new()));
        tx.send(Err(GatewayError::config_parse("broken"))).await.unwrap();
        tx.send(Ok(snapshot("services:\n  api:\n    endpoints: [\"a:80\"]\n")))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(registry.service_keys(), vec!["api"]);
    }

    #[test]
    fn test_rejects_names_that_collide_with_cluster_keys() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.ensure("shop/orders", StrategyKind::RoundRobin);
        registry.add_instance("shop/orders", "10.0.0.1:8080").unwrap();
        let mut reconciler = ConfigReconciler::new(Arc::clone(&registry));

        let report = reconciler.apply(snapshot(
            r#"
services:
  shop/orders:
    endpoints: ["static:80"]
  api:
    endpoints: ["a:80"]
"#,
        ));

        assert_eq!(report.replaced, vec!["api"]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "shop/orders");
        assert_eq!(report.rejected[0].1.error_type(), "configuration_error");
        assert_eq!(
            registry.snapshot("shop/orders").unwrap().endpoints.as_slice(),
            &["10.0.0.1:8080"]
        );
        assert_eq!(reconciler.owned_services(), vec!["api"]);

        // Dropping the name later never removes the cluster pool
        reconciler.apply(snapshot("services:\n  api:\n    endpoints: [\"a:80\"]\n"));
        assert!(registry.contains("shop/orders"));
    }
}
