//! # Load Balancing Strategies
//!
//! Each strategy owns only its own selection state. The endpoint list lives in the
//! [`EndpointPool`] and is passed in on every call, so the registry can keep the pool
//! and the strategy behind a single lock and never expose one without the other.
//!
//! 1. **Round Robin**: a cursor into the pool, advanced on every selection
//! 2. **Least Connections**: an in-flight counter per address; selection reserves capacity
//!    and the caller gives it back with `release`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::pool::EndpointPool;

/// The closed set of strategies the gateway implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round-robin",
            StrategyKind::LeastConnections => "least-connections",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(StrategyKind::RoundRobin),
            "least-connections" | "least_connections" | "leastconnections" => {
                Ok(StrategyKind::LeastConnections)
            }
            other => Err(other.to_string()),
        }
    }
}

/// Selection state for one service's pool.
///
/// Every method runs under the owning service's lock, so implementations use
/// plain `&mut self` state rather than atomics.
pub trait BalancingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Pick an endpoint, or `None` when the pool is empty
    fn select(&mut self, pool: &EndpointPool) -> Option<String>;

    /// Give back capacity reserved by `select`
    fn release(&mut self, _endpoint: &str) {}

    /// The pool was swapped wholesale (SetEndpoints)
    fn endpoints_replaced(&mut self, pool: &EndpointPool);

    /// A single address was appended to the pool
    fn endpoint_added(&mut self, _pool: &EndpointPool, _endpoint: &str) {}

    /// A single address was removed; `pool` is the list after removal
    fn endpoint_removed(&mut self, pool: &EndpointPool, endpoint: &str);
}

/// Round-robin over the pool in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }

    /// Index of the endpoint the next selection will return
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn clamp(&mut self, len: usize) {
        self.cursor = if len == 0 { 0 } else { self.cursor % len };
    }
}

impl BalancingStrategy for RoundRobin {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    fn select(&mut self, pool: &EndpointPool) -> Option<String> {
        if pool.is_empty() {
            return None;
        }

        self.clamp(pool.len());
        let selected = pool.get(self.cursor)?.to_string();
        self.cursor = (self.cursor + 1) % pool.len();
        Some(selected)
    }

    fn endpoints_replaced(&mut self, _pool: &EndpointPool) {
        self.cursor = 0;
    }

    // Incremental changes keep rotation position; only bring the cursor back in range.
    fn endpoint_removed(&mut self, pool: &EndpointPool, _endpoint: &str) {
        self.clamp(pool.len());
    }
}

/// Least outstanding selections wins; ties go to the earliest pool entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeastConnections {
    in_flight: HashMap<String, u64>,
}

impl LeastConnections {
    /// Fresh counters at zero for every endpoint in the pool
    pub fn new(pool: &EndpointPool) -> Self {
        Self {
            in_flight: pool.iter().map(|endpoint| (endpoint.to_string(), 0)).collect(),
        }
    }

    /// Outstanding selections for an address (absent counts as zero)
    pub fn in_flight(&self, endpoint: &str) -> u64 {
        self.in_flight.get(endpoint).copied().unwrap_or(0)
    }

    pub fn in_flight_snapshot(&self) -> HashMap<String, u64> {
        self.in_flight.clone()
    }
}

impl BalancingStrategy for LeastConnections {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastConnections
    }

    fn select(&mut self, pool: &EndpointPool) -> Option<String> {
        let mut selected: Option<(&str, u64)> = None;

        for endpoint in pool.iter() {
            let count = self.in_flight(endpoint);
            match selected {
                Some((_, min)) if count >= min => {}
                _ => selected = Some((endpoint, count)),
            }
        }

        let (endpoint, _) = selected?;
        *self.in_flight.entry(endpoint.to_string()).or_insert(0) += 1;
        Some(endpoint.to_string())
    }

    fn release(&mut self, endpoint: &str) {
        if let Some(count) = self.in_flight.get_mut(endpoint) {
            *count = count.saturating_sub(1);
        }
    }

    fn endpoints_replaced(&mut self, pool: &EndpointPool) {
        let mut retained = HashMap::with_capacity(pool.len());
        for endpoint in pool.iter() {
            let count = self.in_flight(endpoint);
            retained.insert(endpoint.to_string(), count);
        }
        self.in_flight = retained;
    }

    fn endpoint_added(&mut self, _pool: &EndpointPool, endpoint: &str) {
        self.in_flight.entry(endpoint.to_string()).or_insert(0);
    }

    fn endpoint_removed(&mut self, _pool: &EndpointPool, endpoint: &str) {
        self.in_flight.remove(endpoint);
    }
}
