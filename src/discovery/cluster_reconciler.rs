//! # Cluster Reconciler
//!
//! Turns cluster topology events into incremental registry updates.
//!
//! Each service moves through **Unknown → Tracked → Removed**. A tracked service owns a
//! pool keyed `namespace/name`; its members are the serving instances in the same
//! namespace whose labels carry every pair of the service's selector.
//!
//! The reconciler keeps a private topology cache:
//!
//! - service definitions by service key
//! - serving instances by instance key, so a service that shows up after its instances
//!   still finds them
//! - current members per service (instance key → endpoint address), so removals and
//!   selector or port changes touch exactly the addresses that moved
//!
//! Two instance keys can briefly resolve to the same address (a reused pod IP while the old
//! pod's delete is still in flight). The pool holds each address once, so an address only
//! leaves the pool when no remaining member of that service maps to it.
//!
//! Matching scans every tracked service for each instance event. That is O(services) per
//! event, which is fine at cluster scale and needs no reverse index.
//!
//! All handlers are idempotent, so at-least-once delivery and full relists after a
//! resubscription are safe.

use metrics::{counter, gauge};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::KubernetesSettings;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::cluster::{ClusterEvent, EventKind, ServiceDefinition, WorkloadInstance};
use crate::load_balancing::StrategyKind;
use crate::registry::ServiceRegistry;

pub struct ClusterReconciler {
    registry: Arc<ServiceRegistry>,
    strategy: StrategyKind,
    default_port: u16,
    services: HashMap<String, ServiceDefinition>,
    instances: HashMap<String, WorkloadInstance>,
    members: HashMap<String, BTreeMap<String, String>>,
}

/// Keeps the first error while letting the remaining updates run
#[derive(Default)]
struct FirstError(Option<GatewayError>);

impl FirstError {
    fn record<T>(&mut self, result: GatewayResult<T>) {
        if let Err(err) = result {
            self.0.get_or_insert(err);
        }
    }

    fn into_result(self) -> GatewayResult<()> {
        match self.0 {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ClusterReconciler {
    pub fn new(registry: Arc<ServiceRegistry>, strategy: StrategyKind, default_port: u16) -> Self {
        Self {
            registry,
            strategy,
            default_port,
            services: HashMap::new(),
            instances: HashMap::new(),
            members: HashMap::new(),
        }
    }

    pub fn from_settings(registry: Arc<ServiceRegistry>, settings: &KubernetesSettings) -> Self {
        Self::new(registry, settings.strategy, settings.default_port)
    }

    /// Tracked service keys, sorted
    pub fn tracked_services(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.services.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Endpoint addresses currently contributed to a service, sorted
    pub fn members_of(&self, service_key: &str) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .members
            .get(service_key)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        addresses.sort();
        addresses
    }

    /// Number of serving instances currently known
    pub fn known_instances(&self) -> usize {
        self.instances.len()
    }

    /// Apply one event
    pub fn handle(&mut self, event: ClusterEvent) -> GatewayResult<()> {
        counter!("gateway_cluster_events_total", "event" => event.label()).increment(1);

        let result = match event {
            ClusterEvent::Service(EventKind::Deleted, service) => {
                self.service_deleted(&service.key());
                Ok(())
            }
            ClusterEvent::Service(_, service) => self.service_applied(service),
            ClusterEvent::Instance(EventKind::Deleted, instance) => self.instance_gone(&instance.key()),
            ClusterEvent::Instance(_, instance) => self.instance_applied(instance),
            ClusterEvent::ServicesListed(services) => self.services_listed(services),
            ClusterEvent::InstancesListed(instances) => self.instances_listed(instances),
        };

        gauge!("gateway_cluster_tracked_services").set(self.services.len() as f64);
        gauge!("gateway_cluster_serving_instances").set(self.instances.len() as f64);
        result
    }

    fn service_applied(&mut self, service: ServiceDefinition) -> GatewayResult<()> {
        let key = service.key();
        let tracked = self.services.contains_key(&key);

        if self.registry.ensure(&key, self.strategy) && tracked {
            // Pool vanished underneath us; rebuild membership from scratch
            warn!(service = %key, "Service pool was missing, recreating");
            self.members.remove(&key);
        }

        if tracked {
            debug!(service = %key, selector = %service.selector, "Updated tracked service");
        } else {
            info!(service = %key, selector = %service.selector, "Tracking service");
        }

        self.services.insert(key.clone(), service);
        self.sync_service(&key)
    }

    fn service_deleted(&mut self, key: &str) {
        if self.services.remove(key).is_none() {
            debug!(service = %key, "Delete for untracked service ignored");
            return;
        }
        self.members.remove(key);
        self.registry.remove(key);
        info!(service = %key, "Stopped tracking service");
    }

    /// Re-evaluate every known instance against one service
    fn sync_service(&mut self, key: &str) -> GatewayResult<()> {
        let Some(service) = self.services.get(key) else {
            return Ok(());
        };
        let port = service.target_port.unwrap_or(self.default_port);

        let desired: BTreeMap<String, String> = self
            .instances
            .iter()
            .filter(|(_, instance)| {
                instance.namespace == service.namespace && service.selector.matches(&instance.labels)
            })
            .filter_map(|(instance_key, instance)| {
                instance.endpoint(port).map(|address| (instance_key.clone(), address))
            })
            .collect();
        let current = self.members.remove(key).unwrap_or_default();

        let kept: HashSet<&String> = desired.values().collect();
        let held: HashSet<&String> = current.values().collect();
        let mut errors = FirstError::default();
        for address in held.difference(&kept) {
            errors.record(self.registry.remove_instance(key, address));
        }
        for address in kept.difference(&held) {
            errors.record(self.registry.add_instance(key, address));
        }

        self.members.insert(key.to_string(), desired);
        errors.into_result()
    }

    fn instance_applied(&mut self, instance: WorkloadInstance) -> GatewayResult<()> {
        let instance_key = instance.key();
        if !instance.is_serving() {
            debug!(instance = %instance_key, phase = ?instance.phase, "Instance not serving");
            return self.instance_gone(&instance_key);
        }

        self.instances.insert(instance_key.clone(), instance);

        let service_keys: Vec<String> = self.services.keys().cloned().collect();
        let mut errors = FirstError::default();
        for service_key in &service_keys {
            errors.record(self.sync_member(service_key, &instance_key));
        }
        errors.into_result()
    }

    /// Re-evaluate one instance against one service
    fn sync_member(&mut self, service_key: &str, instance_key: &str) -> GatewayResult<()> {
        let Some(service) = self.services.get(service_key) else {
            return Ok(());
        };
        let port = service.target_port.unwrap_or(self.default_port);

        let desired = self
            .instances
            .get(instance_key)
            .filter(|instance| {
                instance.namespace == service.namespace && service.selector.matches(&instance.labels)
            })
            .and_then(|instance| instance.endpoint(port));

        let members = self.members.entry(service_key.to_string()).or_default();
        let current = members.get(instance_key).cloned();
        if current == desired {
            return Ok(());
        }

        if let Some(old) = current {
            members.remove(instance_key);
            release_address(&self.registry, service_key, members, &old)?;
        }
        if let Some(address) = desired {
            members.insert(instance_key.to_string(), address.clone());
            self.registry.add_instance(service_key, &address)?;
            debug!(service = %service_key, instance = %instance_key, endpoint = %address, "Instance joined service");
        }
        Ok(())
    }

    fn instance_gone(&mut self, instance_key: &str) -> GatewayResult<()> {
        self.instances.remove(instance_key);

        let mut errors = FirstError::default();
        for (service_key, members) in self.members.iter_mut() {
            if let Some(address) = members.remove(instance_key) {
                errors.record(release_address(&self.registry, service_key, members, &address));
                debug!(service = %service_key, instance = %instance_key, endpoint = %address, "Instance left service");
            }
        }
        errors.into_result()
    }

    fn services_listed(&mut self, services: Vec<ServiceDefinition>) -> GatewayResult<()> {
        let listed: HashSet<String> = services.iter().map(ServiceDefinition::key).collect();
        let stale: Vec<String> = self
            .services
            .keys()
            .filter(|key| !listed.contains(*key))
            .cloned()
            .collect();
        for key in &stale {
            self.service_deleted(key);
        }

        let mut errors = FirstError::default();
        for service in services {
            errors.record(self.service_applied(service));
        }
        info!(services = self.services.len(), removed = stale.len(), "Resynced services");
        errors.into_result()
    }

    fn instances_listed(&mut self, instances: Vec<WorkloadInstance>) -> GatewayResult<()> {
        let listed: HashSet<String> = instances.iter().map(WorkloadInstance::key).collect();
        let stale: Vec<String> = self
            .instances
            .keys()
            .filter(|key| !listed.contains(*key))
            .cloned()
            .collect();

        let mut errors = FirstError::default();
        for key in &stale {
            errors.record(self.instance_gone(key));
        }
        for instance in instances {
            errors.record(self.instance_applied(instance));
        }
        info!(instances = self.instances.len(), removed = stale.len(), "Resynced instances");
        errors.into_result()
    }

    /// Apply events until the channel closes or `shutdown` is cancelled
    pub async fn run(mut self, mut events: mpsc::Receiver<ClusterEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        let label = event.label();
                        if let Err(err) = self.handle(event) {
                            warn!(event = label, error = %err, "Failed to apply cluster event");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("Cluster reconciler stopped");
    }
}

/// Drop `address` from the pool unless another member of the service still maps to it
fn release_address(
    registry: &ServiceRegistry,
    service_key: &str,
    members: &BTreeMap<String, String>,
    address: &str,
) -> GatewayResult<bool> {
    if members.values().any(|held| held == address) {
        debug!(service = %service_key, endpoint = %address, "Address still held by another instance");
        return Ok(false);
    }
    registry.remove_instance(service_key, address)
}
