//! # Discovery Gateway - Core Library Crate
//!
//! A service-discovery-aware reverse proxy. Incoming requests name a logical service; the
//! gateway picks one backend endpoint for it from a live registry that two independent
//! pipelines keep up to date:
//!
//! - a hot-reloaded routing config file (static endpoint lists per service)
//! - a Kubernetes watch over services and pods (dynamic pod membership)
//!
//! ## Module Layout
//!
//! - `registry` is the only shared mutable state: one entry per service holding its
//!   endpoint pool and load balancer state behind a per-service lock
//! - `load_balancing` implements round-robin and least-connections over a pool
//! - `discovery` contains both update pipelines and the typed cluster events they consume
//! - `routing` answers "which endpoint for this service?" and enforces the release contract
//! - `gateway` is the HTTP surface that forwards requests to the chosen endpoint

/// Error types, routing config snapshots, and process settings
pub mod core;

/// Endpoint pools and the load balancing strategies that select from them
pub mod load_balancing;

/// Concurrent service key → (pool, balancer) registry shared by every component
pub mod registry;

/// Config file and Kubernetes pipelines that reconcile the registry
pub mod discovery;

/// Service key → endpoint selection
pub mod routing;

/// HTTP proxy and admin endpoints
pub mod gateway;

/// Logging and metrics setup
pub mod observability;

pub use core::config::{GatewaySettings, RoutingConfig};
pub use core::error::{GatewayError, GatewayResult};
pub use gateway::server::{GatewayServer, ServerConfig};
pub use registry::ServiceRegistry;
pub use routing::router::{EndpointLease, Router, Selection};
