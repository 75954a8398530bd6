//! # Service Registry
//!
//! The registry is the single source of truth consulted by routing: a concurrent map from
//! service key to the service's endpoint pool and balancer state.
//!
//! ## Locking
//!
//! - The `DashMap` shard locks only guard inserting and removing whole entries.
//! - Each entry is an `Arc<Mutex<ServiceEntry>>`; pool and balancer live behind the same
//!   mutex, so a reader can never observe one updated without the other.
//! - Lookups clone the `Arc` out of the map and release the shard before touching the
//!   service mutex. Selection traffic on one service never waits on another service's
//!   reconciliation.
//! - Whole-entry writers (`replace`) overwrite an existing entry in place under its service
//!   mutex, taken after the shard lock is released. Concurrent incremental updates to the
//!   same key are serialized by that mutex. A `replace` racing a `remove` of the same key
//!   orders as replace-then-remove.
//!
//! ## Rust Concepts Used
//!
//! - `DashMap` for a sharded concurrent `HashMap`
//! - `parking_lot::Mutex` for short, non-poisoning critical sections
//! - `Arc<T>` so a handle stays valid even if the entry is removed while it is in use

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::{Balancer, BalancerState, EndpointPool, StrategyKind};

/// Pool and strategy state for one service, always updated together
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pool: EndpointPool,
    balancer: Balancer,
}

impl ServiceEntry {
    fn new(pool: EndpointPool, kind: StrategyKind) -> Self {
        let balancer = Balancer::new(kind, &pool);
        Self { pool, balancer }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }
}

/// Consistent, point-in-time copy of one registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub service: String,
    pub endpoints: EndpointPool,
    pub state: BalancerState,
}

impl ServiceSnapshot {
    pub fn strategy(&self) -> StrategyKind {
        match self.state {
            BalancerState::RoundRobin { .. } => StrategyKind::RoundRobin,
            BalancerState::LeastConnections { .. } => StrategyKind::LeastConnections,
        }
    }
}

/// Handle returned by [`ServiceRegistry::lookup`]
///
/// Every operation on the handle locks the service once, so the pool and strategy it
/// sees are always a matching pair.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    key: String,
    entry: Arc<Mutex<ServiceEntry>>,
}

impl ServiceHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn strategy(&self) -> StrategyKind {
        self.entry.lock().balancer.kind()
    }

    /// Select an endpoint; fails with `NoEndpointsAvailable` on an empty pool
    pub fn next_endpoint(&self) -> GatewayResult<String> {
        self.select().map(|(endpoint, _)| endpoint)
    }

    /// Select an endpoint together with the strategy that picked it, under one lock
    pub fn select(&self) -> GatewayResult<(String, StrategyKind)> {
        let mut entry = self.entry.lock();
        let ServiceEntry { pool, balancer } = &mut *entry;
        let kind = balancer.kind();
        match balancer.next_endpoint(pool) {
            Some(endpoint) => {
                debug!(
                    service = %self.key,
                    endpoint = %endpoint,
                    strategy = %kind,
                    "Selected endpoint"
                );
                Ok((endpoint, kind))
            }
            None => Err(GatewayError::no_endpoints(&self.key)),
        }
    }

    /// Give back capacity reserved by `next_endpoint` (no-op for round-robin)
    pub fn release(&self, endpoint: &str) {
        self.entry.lock().balancer.release(endpoint);
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let entry = self.entry.lock();
        ServiceSnapshot {
            service: self.key.clone(),
            endpoints: entry.pool.clone(),
            state: entry.balancer.state(),
        }
    }
}

/// Registry-wide counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_endpoints: usize,
    pub empty_services: usize,
}

/// Concurrent mapping from service key to (pool, balancer)
///
/// Construct one per process and share it with `Arc`; every pipeline and the router
/// receive it explicitly.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: DashMap<String, Arc<Mutex<ServiceEntry>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Look up a service. The returned handle stays usable after a later removal.
    pub fn lookup(&self, service: &str) -> GatewayResult<ServiceHandle> {
        let entry = self
            .entries
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::not_found(service))?;

        Ok(ServiceHandle {
            key: service.to_string(),
            entry,
        })
    }

    pub fn contains(&self, service: &str) -> bool {
        self.entries.contains_key(service)
    }

    /// Wholesale replacement used by config reload.
    ///
    /// Strategy state is rebuilt from scratch: the round-robin cursor restarts at zero and
    /// every least-connections counter starts at zero.
    pub fn replace<I, S>(&self, service: &str, endpoints: I, kind: StrategyKind)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fresh = ServiceEntry::new(EndpointPool::from_endpoints(endpoints), kind);
        let endpoint_count = fresh.pool.len();

        match self.entries.entry(service.to_string()) {
            Entry::Occupied(occupied) => {
                let existing = Arc::clone(occupied.get());
                // Release the shard before waiting on the service mutex
                drop(occupied);
                *existing.lock() = fresh;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(fresh)));
            }
        }

        gauge!("gateway_registered_services").set(self.entries.len() as f64);
        info!(
            service = %service,
            endpoints = endpoint_count,
            strategy = %kind,
            "Replaced service endpoints"
        );
    }

    /// Drop a service entirely. Returns `false` if it was not registered.
    pub fn remove(&self, service: &str) -> bool {
        let removed = self.entries.remove(service).is_some();
        if removed {
            gauge!("gateway_registered_services").set(self.entries.len() as f64);
            info!(service = %service, "Removed service");
        }
        removed
    }

    /// Create an empty pool if the service is unknown. Returns `true` if it was created.
    pub fn ensure(&self, service: &str, kind: StrategyKind) -> bool {
        match self.entries.entry(service.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(ServiceEntry::new(EndpointPool::new(), kind))));
                gauge!("gateway_registered_services").set(self.entries.len() as f64);
                debug!(service = %service, strategy = %kind, "Created empty service pool");
                true
            }
        }
    }

    /// Incrementally add one address; a repeat add is a no-op.
    ///
    /// Strategy state for every other address is preserved. Returns `true` if the pool
    /// changed.
    pub fn add_instance(&self, service: &str, endpoint: &str) -> GatewayResult<bool> {
        let handle = self.lookup(service)?;
        let mut entry = handle.entry.lock();
        let ServiceEntry { pool, balancer } = &mut *entry;

        if !pool.insert(endpoint) {
            return Ok(false);
        }
        balancer.endpoint_added(pool, endpoint);
        debug!(service = %service, endpoint = %endpoint, "Added endpoint");
        Ok(true)
    }

    /// Incrementally remove one address; removing an absent address is a no-op.
    ///
    /// A round-robin cursor past the end of the shrunk pool is wrapped back into range.
    pub fn remove_instance(&self, service: &str, endpoint: &str) -> GatewayResult<bool> {
        let handle = self.lookup(service)?;
        let mut entry = handle.entry.lock();
        let ServiceEntry { pool, balancer } = &mut *entry;

        if !pool.remove(endpoint) {
            return Ok(false);
        }
        balancer.endpoint_removed(pool, endpoint);
        debug!(service = %service, endpoint = %endpoint, "Removed endpoint");
        Ok(true)
    }

    /// Swap the endpoint list while keeping the current strategy's state where it still
    /// applies (least-connections keeps counts of retained addresses).
    pub fn set_endpoints<I, S>(&self, service: &str, endpoints: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handle = self.lookup(service)?;
        let mut entry = handle.entry.lock();
        entry.pool = EndpointPool::from_endpoints(endpoints);
        let ServiceEntry { pool, balancer } = &mut *entry;
        balancer.endpoints_replaced(pool);
        Ok(())
    }

    pub fn next_endpoint(&self, service: &str) -> GatewayResult<String> {
        self.lookup(service)?.next_endpoint()
    }

    /// Release capacity for a previous selection. Unknown services are ignored.
    pub fn release_endpoint(&self, service: &str, endpoint: &str) {
        if let Ok(handle) = self.lookup(service) {
            handle.release(endpoint);
        }
    }

    pub fn snapshot(&self, service: &str) -> Option<ServiceSnapshot> {
        self.lookup(service).ok().map(|handle| handle.snapshot())
    }

    /// Snapshots of every service, sorted by key
    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut handles: Vec<ServiceHandle> = self
            .entries
            .iter()
            .map(|entry| ServiceHandle {
                key: entry.key().clone(),
                entry: Arc::clone(entry.value()),
            })
            .collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        handles.iter().map(ServiceHandle::snapshot).collect()
    }

    /// All registered service keys, sorted
    pub fn service_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        self.snapshots()
            .iter()
            .fold(RegistryStats::default(), |mut stats, snapshot| {
                stats.total_services += 1;
                stats.total_endpoints += snapshot.endpoints.len();
                if snapshot.endpoints.is_empty() {
                    stats.empty_services += 1;
                }
                stats
            })
    }
}
