//! Typed cluster topology events.
//!
//! Orchestrator objects are decoded once at the watch boundary into these types; the
//! reconciler never sees raw API objects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Labels = BTreeMap<String, String>;

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector {
    match_labels: Labels,
}

impl LabelSelector {
    pub fn new(match_labels: Labels) -> Self {
        Self { match_labels }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// True if `labels` carries every selector pair. An empty selector selects nothing.
    pub fn matches(&self, labels: &Labels) -> bool {
        !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", pairs.join(","))
    }
}

/// A discoverable service: a named selector over workload instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub namespace: String,
    pub name: String,
    pub selector: LabelSelector,
    /// Numeric port on the instances; `None` falls back to the configured default
    pub target_port: Option<u16>,
}

impl ServiceDefinition {
    /// Registry key, `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl InstancePhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => InstancePhase::Pending,
            "Running" => InstancePhase::Running,
            "Succeeded" => InstancePhase::Succeeded,
            "Failed" => InstancePhase::Failed,
            _ => InstancePhase::Unknown,
        }
    }
}

/// A running unit of a workload (a pod)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub namespace: String,
    pub name: String,
    pub labels: Labels,
    pub ip: Option<String>,
    pub phase: InstancePhase,
    pub ready: bool,
    pub terminating: bool,
}

impl WorkloadInstance {
    /// Instance key, `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Running, ready, not being deleted, and addressable
    pub fn is_serving(&self) -> bool {
        self.phase == InstancePhase::Running
            && self.ready
            && !self.terminating
            && self.ip.as_deref().map_or(false, |ip| !ip.is_empty())
    }

    pub fn endpoint(&self, port: u16) -> Option<String> {
        self.ip.as_ref().map(|ip| format!("{}:{}", ip, port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// One decoded topology change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Service(EventKind, ServiceDefinition),
    Instance(EventKind, WorkloadInstance),
    /// Full service list after a (re)subscription
    ServicesListed(Vec<ServiceDefinition>),
    /// Full instance list after a (re)subscription
    InstancesListed(Vec<WorkloadInstance>),
}

impl ClusterEvent {
    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ClusterEvent::Service(EventKind::Deleted, _) => "service_deleted",
            ClusterEvent::Service(_, _) => "service_applied",
            ClusterEvent::Instance(EventKind::Deleted, _) => "instance_deleted",
            ClusterEvent::Instance(_, _) => "instance_applied",
            ClusterEvent::ServicesListed(_) => "services_listed",
            ClusterEvent::InstancesListed(_) => "instances_listed",
        }
    }
}
