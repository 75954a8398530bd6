pub mod balancer;
pub mod pool;
pub mod strategies;

pub use balancer::{Balancer, BalancerState};
pub use pool::EndpointPool;
pub use strategies::{BalancingStrategy, LeastConnections, RoundRobin, StrategyKind};
