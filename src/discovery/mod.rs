pub mod cluster;
pub mod cluster_reconciler;
pub mod config_reconciler;
pub mod config_source;
pub mod kubernetes;

pub use cluster::{
    ClusterEvent, EventKind, InstancePhase, LabelSelector, Labels, ServiceDefinition,
    WorkloadInstance,
};
pub use cluster_reconciler::ClusterReconciler;
pub use config_reconciler::{ConfigReconciler, ReconcileReport, ReconcilerState};
pub use config_source::{ConfigSource, ConfigUpdate, ConfigWatch};
pub use kubernetes::KubernetesWatcher;
