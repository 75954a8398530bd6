//! # Balancer
//!
//! `Balancer` is the closed set of strategy variants the registry stores next to each
//! pool. The strategy is resolved once, when configuration is parsed or a cluster
//! service is first tracked, so there is no "missing strategy" state to trip over at
//! selection time.
//!
//! ## Rust Concepts Used
//!
//! - An `enum` with data replaces a `Box<dyn Trait>`: the set of strategies is closed, so
//!   `match` dispatch is exhaustive and checked by the compiler
//! - The `metrics` macros record counters through whatever recorder is installed (a no-op
//!   when none is)

use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;

use super::pool::EndpointPool;
use super::strategies::{BalancingStrategy, LeastConnections, RoundRobin, StrategyKind};

/// Strategy state stored alongside a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Balancer {
    RoundRobin(RoundRobin),
    LeastConnections(LeastConnections),
}

/// Read-only view of strategy state for logging and the admin endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum BalancerState {
    RoundRobin { cursor: usize },
    LeastConnections { in_flight: HashMap<String, u64> },
}

impl Balancer {
    /// Fresh state: cursor at zero, or a zero counter for every pool entry
    pub fn new(kind: StrategyKind, pool: &EndpointPool) -> Self {
        match kind {
            StrategyKind::RoundRobin => Balancer::RoundRobin(RoundRobin::new()),
            StrategyKind::LeastConnections => {
                Balancer::LeastConnections(LeastConnections::new(pool))
            }
        }
    }

    fn strategy(&self) -> &dyn BalancingStrategy {
        match self {
            Balancer::RoundRobin(rr) => rr,
            Balancer::LeastConnections(lc) => lc,
        }
    }

    fn strategy_mut(&mut self) -> &mut dyn BalancingStrategy {
        match self {
            Balancer::RoundRobin(rr) => rr,
            Balancer::LeastConnections(lc) => lc,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy().kind()
    }

    /// Select and advance (or reserve) in one step
    pub fn next_endpoint(&mut self, pool: &EndpointPool) -> Option<String> {
        let kind = self.kind().as_str();
        let selected = self.strategy_mut().select(pool);

        match selected {
            Some(_) => counter!("gateway_selections_total", "strategy" => kind).increment(1),
            None => counter!("gateway_failed_selections_total", "strategy" => kind).increment(1),
        }

        selected
    }

    pub fn release(&mut self, endpoint: &str) {
        self.strategy_mut().release(endpoint);
    }

    pub fn endpoints_replaced(&mut self, pool: &EndpointPool) {
        self.strategy_mut().endpoints_replaced(pool);
    }

    pub fn endpoint_added(&mut self, pool: &EndpointPool, endpoint: &str) {
        self.strategy_mut().endpoint_added(pool, endpoint);
    }

    pub fn endpoint_removed(&mut self, pool: &EndpointPool, endpoint: &str) {
        self.strategy_mut().endpoint_removed(pool, endpoint);
    }

    pub fn state(&self) -> BalancerState {
        match self {
            Balancer::RoundRobin(rr) => BalancerState::RoundRobin { cursor: rr.cursor() },
            Balancer::LeastConnections(lc) => BalancerState::LeastConnections {
                in_flight: lc.in_flight_snapshot(),
            },
        }
    }
}
