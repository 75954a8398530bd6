//! # Kubernetes Watcher
//!
//! Streams `Service` and `Pod` changes from the API server and decodes them into
//! [`ClusterEvent`]s for the [`ClusterReconciler`](super::cluster_reconciler::ClusterReconciler).
//!
//! Each resource kind has its own long-lived watch task. When a watch stream fails the
//! error is reported as [`GatewayError::WatchStream`], the task backs off, and then
//! resubscribes. A resubscription starts with a full relist, which lets the reconciler
//! drop anything that disappeared while the stream was down. Until then the last known
//! pools keep serving.
//!
//! ## Rust Concepts Used
//!
//! - `kube::runtime::watcher` for list-then-watch streams with resource versions
//! - Generic functions over `kube::Resource` so both watch loops share one implementation
//! - `futures::StreamExt` for polling the boxed stream inside `tokio::select!`

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Resource;
use metrics::counter;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::KubernetesSettings;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::cluster::{
    ClusterEvent, EventKind, InstancePhase, LabelSelector, ServiceDefinition, WorkloadInstance,
};

const DEFAULT_NAMESPACE: &str = "default";

pub struct KubernetesWatcher {
    client: kube::Client,
    namespace: Option<String>,
    resubscribe_backoff: Duration,
}

impl KubernetesWatcher {
    /// Build a client from an explicit kubeconfig, or infer one (in-cluster or local)
    pub async fn connect(settings: &KubernetesSettings) -> GatewayResult<Self> {
        let client = if let Some(kubeconfig_path) = &settings.kubeconfig_path {
            let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig_path).map_err(|e| {
                GatewayError::Kubernetes {
                    message: format!("Failed to read kubeconfig: {}", e),
                }
            })?;
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                .await
                .map_err(|e| GatewayError::Kubernetes {
                    message: format!("Failed to create kube config: {}", e),
                })?;
            kube::Client::try_from(config)?
        } else {
            kube::Client::try_default().await?
        };

        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: kube::Client, settings: &KubernetesSettings) -> Self {
        Self {
            client,
            namespace: settings.namespace.clone(),
            resubscribe_backoff: settings.resubscribe_backoff,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    /// Spawn the service and pod watch loops
    pub fn spawn(self, events: mpsc::Sender<ClusterEvent>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            namespace = self.namespace.as_deref().unwrap_or("<all>"),
            "Starting Kubernetes watchers"
        );

        let services = tokio::spawn(watch_resource(
            self.api::<Service>(),
            "services",
            decode_service_event,
            events.clone(),
            shutdown.clone(),
            self.resubscribe_backoff,
        ));
        let pods = tokio::spawn(watch_resource(
            self.api::<Pod>(),
            "pods",
            decode_pod_event,
            events,
            shutdown,
            self.resubscribe_backoff,
        ));

        vec![services, pods]
    }
}

enum StreamEnd {
    Shutdown,
    ReceiverClosed,
    Resubscribe,
}

async fn watch_resource<K, F>(
    api: Api<K>,
    resource: &'static str,
    decode: F,
    events: mpsc::Sender<ClusterEvent>,
    shutdown: CancellationToken,
    backoff: Duration,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: Fn(watcher::Event<K>) -> Option<ClusterEvent> + Send,
{
    loop {
        let mut stream = watcher(api.clone(), watcher::Config::default()).boxed();
        debug!(resource = resource, "Subscribed to watch stream");

        let end = loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break StreamEnd::Shutdown,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    if let Some(event) = decode(event) {
                        if events.send(event).await.is_err() {
                            break StreamEnd::ReceiverClosed;
                        }
                    }
                }
                Some(Err(e)) => {
                    let err = GatewayError::watch_stream(resource, e.to_string());
                    counter!("gateway_watch_stream_errors_total", "resource" => resource).increment(1);
                    warn!(
                        resource = resource,
                        error = %err,
                        backoff = %humantime::format_duration(backoff),
                        "Watch stream failed, serving last known topology until resubscribed"
                    );
                    break StreamEnd::Resubscribe;
                }
                None => {
                    warn!(resource = resource, "Watch stream ended, resubscribing");
                    break StreamEnd::Resubscribe;
                }
            }
        };

        match end {
            StreamEnd::Shutdown | StreamEnd::ReceiverClosed => break,
            StreamEnd::Resubscribe => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    debug!(resource = resource, "Watch loop stopped");
}

fn decode_service_event(event: watcher::Event<Service>) -> Option<ClusterEvent> {
    match event {
        watcher::Event::Applied(service) => {
            decode_service(&service).map(|s| ClusterEvent::Service(EventKind::Modified, s))
        }
        watcher::Event::Deleted(service) => {
            decode_service(&service).map(|s| ClusterEvent::Service(EventKind::Deleted, s))
        }
        watcher::Event::Restarted(services) => Some(ClusterEvent::ServicesListed(
            services.iter().filter_map(decode_service).collect(),
        )),
    }
}

fn decode_pod_event(event: watcher::Event<Pod>) -> Option<ClusterEvent> {
    match event {
        watcher::Event::Applied(pod) => {
            decode_pod(&pod).map(|p| ClusterEvent::Instance(EventKind::Modified, p))
        }
        watcher::Event::Deleted(pod) => {
            decode_pod(&pod).map(|p| ClusterEvent::Instance(EventKind::Deleted, p))
        }
        watcher::Event::Restarted(pods) => Some(ClusterEvent::InstancesListed(
            pods.iter().filter_map(decode_pod).collect(),
        )),
    }
}

/// Decode a `Service`. Objects without a name are skipped.
pub fn decode_service(service: &Service) -> Option<ServiceDefinition> {
    let name = service.metadata.name.clone()?;
    let namespace = service
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let spec = service.spec.as_ref();

    let selector = spec
        .and_then(|spec| spec.selector.clone())
        .map(LabelSelector::new)
        .unwrap_or_default();

    // A named target port cannot be resolved without the pod spec; the default applies
    let target_port = spec
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|port| match &port.target_port {
            Some(IntOrString::Int(number)) => u16::try_from(*number).ok(),
            Some(IntOrString::String(_)) => None,
            None => u16::try_from(port.port).ok(),
        });

    Some(ServiceDefinition {
        namespace,
        name,
        selector,
        target_port,
    })
}

/// Decode a `Pod`. Objects without a name are skipped.
pub fn decode_pod(pod: &Pod) -> Option<WorkloadInstance> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let status = pod.status.as_ref();

    let phase = status
        .and_then(|status| status.phase.as_deref())
        .map(InstancePhase::parse)
        .unwrap_or(InstancePhase::Unknown);
    let ready = status
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false);

    Some(WorkloadInstance {
        namespace,
        name,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        ip: status.and_then(|status| status.pod_ip.clone()),
        phase,
        ready,
        terminating: pod.metadata.deletion_timestamp.is_some(),
    })
}
