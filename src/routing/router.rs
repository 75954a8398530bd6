//! # Router Module
//!
//! Resolves a service key to one backend endpoint by consulting the registry.
//!
//! The router never retries: `NotFound` and `NoEndpointsAvailable` go straight back to
//! the caller, who decides what to do with them. Once shutdown begins it refuses new
//! routes with `ShuttingDown`, while selections already handed out complete normally.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<ServiceRegistry>` shared with the reconcilers; the router holds no state of its own
//! - `Drop` on [`EndpointLease`] so a proxied call gives its capacity back exactly once,
//!   whether it succeeded, failed, or was cancelled

use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::StrategyKind;
use crate::registry::ServiceRegistry;

/// One routing decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub service: String,
    pub endpoint: String,
    pub strategy: StrategyKind,
}

#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ServiceRegistry>,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(registry: Arc<ServiceRegistry>, shutdown: CancellationToken) -> Self {
        Self { registry, shutdown }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Pick an endpoint for `service`.
    ///
    /// With least-connections the caller owes a matching [`Router::release`]; prefer
    /// [`Router::acquire`], which releases on drop.
    pub fn route(&self, service: &str) -> GatewayResult<Selection> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }

        let result = self.registry.lookup(service).and_then(|handle| {
            let (endpoint, strategy) = handle.select()?;
            Ok(Selection {
                service: service.to_string(),
                endpoint,
                strategy,
            })
        });

        if let Err(err) = &result {
            counter!("gateway_route_errors_total", "error" => err.error_type()).increment(1);
            debug!(service = %service, error = %err, "Routing failed");
        }
        result
    }

    /// Return capacity taken by `route`
    pub fn release(&self, selection: &Selection) {
        self.registry
            .release_endpoint(&selection.service, &selection.endpoint);
    }

    /// Route and wrap the selection in a lease that releases it when dropped
    pub fn acquire(&self, service: &str) -> GatewayResult<EndpointLease> {
        let selection = self.route(service)?;
        Ok(EndpointLease {
            router: self.clone(),
            selection,
        })
    }

    /// Split a request path into a registered service key and the remaining path.
    ///
    /// Both `/{name}/rest` and `/{namespace}/{name}/rest` are recognised; when both
    /// prefixes are registered the longer key wins.
    pub fn resolve_path(&self, path: &str) -> Option<(String, String)> {
        let trimmed = path.trim_start_matches('/');
        let mut segments = trimmed.splitn(3, '/');
        let first = segments.next().filter(|s| !s.is_empty())?;
        let second = segments.next().filter(|s| !s.is_empty());

        if let Some(second) = second {
            let key = format!("{}/{}", first, second);
            if self.registry.contains(&key) {
                let rest = segments.next().unwrap_or("");
                return Some((key, format!("/{}", rest)));
            }
        }

        if self.registry.contains(first) {
            let rest = trimmed[first.len()..].trim_start_matches('/');
            return Some((first.to_string(), format!("/{}", rest)));
        }

        None
    }
}

/// A selection that gives its capacity back when dropped
#[derive(Debug)]
pub struct EndpointLease {
    router: Router,
    selection: Selection,
}

impl EndpointLease {
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn endpoint(&self) -> &str {
        &self.selection.endpoint
    }

    pub fn service(&self) -> &str {
        &self.selection.service
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.router.release(&self.selection);
    }
}
