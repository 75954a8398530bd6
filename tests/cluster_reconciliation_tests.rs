//! # Cluster Reconciliation Tests
//!
//! Feeds typed cluster events through a running `ClusterReconciler` and checks the
//! resulting pools, alongside a config-file service sharing the same registry.

use discovery_gateway::discovery::{
    ClusterEvent, ClusterReconciler, EventKind, InstancePhase, LabelSelector, ServiceDefinition,
    WorkloadInstance,
};
use discovery_gateway::load_balancing::StrategyKind;
use discovery_gateway::{GatewayError, Router, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn service(namespace: &str, name: &str, selector: &[(&str, &str)]) -> ServiceDefinition {
    ServiceDefinition {
        namespace: namespace.to_string(),
        name: name.to_string(),
        selector: LabelSelector::from_pairs(selector.iter().copied()),
        target_port: Some(8080),
    }
}

fn pod(name: &str, ip: &str, labels: &[(&str, &str)]) -> WorkloadInstance {
    WorkloadInstance {
        namespace: "shop".to_string(),
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ip: Some(ip.to_string()),
        phase: InstancePhase::Running,
        ready: true,
        terminating: false,
    }
}

fn endpoints(registry: &ServiceRegistry, key: &str) -> Vec<String> {
    registry
        .snapshot(key)
        .map(|snapshot| snapshot.endpoints.as_slice().to_vec())
        .unwrap_or_default()
}

/// A superset-labelled instance joins on a ready event and leaves on delete
#[test]
fn test_superset_labels_join_and_leave() {
    let registry = Arc::new(ServiceRegistry::new());
    let mut reconciler = ClusterReconciler::new(Arc::clone(&registry), StrategyKind::RoundRobin, 80);

    reconciler
        .handle(ClusterEvent::Service(
            EventKind::Added,
            service("shop", "orders", &[("app", "orders")]),
        ))
        .unwrap();

    let instance = pod("orders-0", "10.0.0.1", &[("app", "orders"), ("version", "v2")]);
    reconciler
        .handle(ClusterEvent::Instance(EventKind::Added, instance.clone()))
        .unwrap();
    assert_eq!(endpoints(&registry, "shop/orders"), vec!["10.0.0.1:8080"]);

    reconciler
        .handle(ClusterEvent::Instance(EventKind::Deleted, instance))
        .unwrap();
    assert!(endpoints(&registry, "shop/orders").is_empty());
}

/// One instance matching two services with disjoint selectors joins both pools
#[test]
fn test_instance_matching_two_services() {
    let registry = Arc::new(ServiceRegistry::new());
    let mut reconciler = ClusterReconciler::new(Arc::clone(&registry), StrategyKind::RoundRobin, 80);

    reconciler
        .handle(ClusterEvent::Service(
            EventKind::Added,
            service("shop", "orders", &[("app", "orders")]),
        ))
        .unwrap();
    reconciler
        .handle(ClusterEvent::Service(
            EventKind::Added,
            service("shop", "canary", &[("track", "canary")]),
        ))
        .unwrap();

    reconciler
        .handle(ClusterEvent::Instance(
            EventKind::Added,
            pod("orders-c", "10.0.0.7", &[("app", "orders"), ("track", "canary")]),
        ))
        .unwrap();
    reconciler
        .handle(ClusterEvent::Instance(
            EventKind::Added,
            pod("orders-s", "10.0.0.8", &[("app", "orders"), ("track", "stable")]),
        ))
        .unwrap();

    assert_eq!(
        endpoints(&registry, "shop/orders"),
        vec!["10.0.0.7:8080", "10.0.0.8:8080"]
    );
    assert_eq!(endpoints(&registry, "shop/canary"), vec!["10.0.0.7:8080"]);
}

/// Pending and not-ready instances are never routed to
#[test]
fn test_not_ready_instances_are_ignored() {
    let registry = Arc::new(ServiceRegistry::new());
    let mut reconciler = ClusterReconciler::new(Arc::clone(&registry), StrategyKind::RoundRobin, 80);
    reconciler
        .handle(ClusterEvent::Service(
            EventKind::Added,
            service("shop", "orders", &[("app", "orders")]),
        ))
        .unwrap();

    let mut pending = pod("orders-0", "10.0.0.1", &[("app", "orders")]);
    pending.phase = InstancePhase::Pending;
    let mut unready = pod("orders-1", "10.0.0.2", &[("app", "orders")]);
    unready.ready = false;

    reconciler
        .handle(ClusterEvent::Instance(EventKind::Added, pending.clone()))
        .unwrap();
    reconciler
        .handle(ClusterEvent::Instance(EventKind::Added, unready))
        .unwrap();
    assert!(endpoints(&registry, "shop/orders").is_empty());

    // Becoming ready is an update like any other
    pending.phase = InstancePhase::Running;
    reconciler
        .handle(ClusterEvent::Instance(EventKind::Modified, pending))
        .unwrap();
    assert_eq!(endpoints(&registry, "shop/orders"), vec!["10.0.0.1:8080"]);
}

/// Repeated delivery of the same events leaves exactly one copy of each address
#[test]
fn test_redelivery_is_idempotent() {
    let registry = Arc::new(ServiceRegistry::new());
    let mut reconciler = ClusterReconciler::new(Arc::clone(&registry), StrategyKind::RoundRobin, 80);

    let definition = service("shop", "orders", &[("app", "orders")]);
    let instance = pod("orders-0", "10.0.0.1", &[("app", "orders")]);
    for _ in 0..3 {
        reconciler
            .handle(ClusterEvent::Service(EventKind::Modified, definition.clone()))
            .unwrap();
        reconciler
            .handle(ClusterEvent::Instance(EventKind::Modified, instance.clone()))
            .unwrap();
    }

    assert_eq!(endpoints(&registry, "shop/orders"), vec!["10.0.0.1:8080"]);
}

/// The running reconciler feeds the router; deleting the service makes it unknown
#[tokio::test]
async fn test_running_reconciler_feeds_router() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.replace("static", vec!["s:80"], StrategyKind::RoundRobin);

    let shutdown = CancellationToken::new();
    let reconciler = ClusterReconciler::new(Arc::clone(&registry), StrategyKind::LeastConnections, 80);
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(reconciler.run(rx, shutdown.clone()));
    let router = Router::new(Arc::clone(&registry), shutdown.clone());

    let definition = service("shop", "orders", &[("app", "orders")]);
    tx.send(ClusterEvent::ServicesListed(vec![definition.clone()]))
        .await
        .unwrap();
    tx.send(ClusterEvent::InstancesListed(vec![
        pod("orders-0", "10.0.0.1", &[("app", "orders")]),
        pod("orders-1", "10.0.0.2", &[("app", "orders")]),
    ]))
    .await
    .unwrap();

    let mut ready = false;
    for _ in 0..100 {
        if endpoints(&registry, "shop/orders").len() == 2 {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready);

    let first = router.route("shop/orders").unwrap();
    let second = router.route("shop/orders").unwrap();
    assert_ne!(first.endpoint, second.endpoint);
    assert_eq!(first.strategy, StrategyKind::LeastConnections);
    router.release(&first);
    router.release(&second);

    tx.send(ClusterEvent::Service(EventKind::Deleted, definition))
        .await
        .unwrap();
    let mut removed = false;
    for _ in 0..100 {
        if !registry.contains("shop/orders") {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed);
    assert_eq!(
        router.route("shop/orders").unwrap_err(),
        GatewayError::not_found("shop/orders")
    );

    // The config-file service was never touched by the cluster pipeline
    assert_eq!(router.route("static").unwrap().endpoint, "s:80");

    shutdown.cancel();
    task.await.unwrap();
}
