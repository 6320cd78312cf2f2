//! Service identity resolution: from a logical service name to the workload
//! that implements it.
//!
//! Pods declare the service they implement with the
//! `lattice.dev/server-identity` label. Pods that predate the label are
//! matched by name instead: a pod implements `svc` if it is named `svc` or
//! `svc-<anything>`. The name match is a weak heuristic (`api` also matches
//! the pods of `api-gateway`) and is only consulted when no pod carries the
//! label.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::Call;
use crate::identity::format_identity;
use crate::{Error, LINKERD_INJECT_ANNOTATION, SERVER_IDENTITY_LABEL};

/// A container port exposed by a workload
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkloadPort {
    /// Port number
    pub port: u16,
    /// Protocol (TCP, UDP, SCTP)
    pub protocol: String,
}

/// The workload implementing a service, as seen on one representative pod
#[derive(Clone, Debug, PartialEq)]
pub struct Workload {
    /// Logical service name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Service account the pods run as
    pub service_account: String,
    /// Identity selecting the workload's pods
    pub server_identity: String,
    /// Whether the pods carry the mesh sidecar
    pub sidecar_present: bool,
    /// Container ports
    pub ports: Vec<WorkloadPort>,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
}

/// A call together with the workload it targets
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedCall {
    /// The declared call
    pub call: Call,
    /// Workload implementing the call target
    pub workload: Workload,
}

/// Lists pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// List pods in a namespace, optionally filtered by label selector
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<Pod>, Error>;
}

/// Pod lister backed by the Kubernetes API
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a new client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = match &label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        Ok(api.list(&params).await?.items)
    }
}

/// Resolves service names to workloads
#[derive(Clone)]
pub struct ServiceIdentityResolver {
    pods: Arc<dyn WorkloadClient>,
}

impl ServiceIdentityResolver {
    /// Create a resolver over a pod lister
    pub fn new(pods: Arc<dyn WorkloadClient>) -> Self {
        Self { pods }
    }

    /// Find the workload implementing `service` in `namespace`.
    ///
    /// Terminating and finished pods are ignored. When several pods match,
    /// the lexicographically first by name is the representative.
    pub async fn resolve(&self, service: &str, namespace: &str) -> Result<Workload, Error> {
        let identity = format_identity(service, namespace);
        let labeled = self
            .pods
            .list_pods(namespace, Some(format!("{SERVER_IDENTITY_LABEL}={identity}")))
            .await?;

        let mut candidates: Vec<Pod> = labeled.into_iter().filter(is_running).collect();
        if candidates.is_empty() {
            debug!(service, namespace, "no labeled pods, falling back to name prefix");
            candidates = self
                .pods
                .list_pods(namespace, None)
                .await?
                .into_iter()
                .filter(|p| name_matches_service(&p.name_any(), service))
                .filter(is_running)
                .collect();
        }

        candidates
            .into_iter()
            .min_by_key(|p| p.name_any())
            .map(|pod| workload_from_pod(&pod, service, namespace))
            .ok_or_else(|| Error::pod_not_found(service, namespace))
    }
}

/// Whether a pod is a plausible implementation of `service` in its namespace:
/// labeled with the service's identity, or named after it.
pub fn pod_implements_service(pod: &Pod, service: &str, namespace: &str) -> bool {
    match pod.labels().get(SERVER_IDENTITY_LABEL) {
        Some(identity) => *identity == format_identity(service, namespace),
        None => name_matches_service(&pod.name_any(), service),
    }
}

fn name_matches_service(pod_name: &str, service: &str) -> bool {
    pod_name == service
        || pod_name
            .strip_prefix(service)
            .is_some_and(|rest| rest.starts_with('-'))
}

fn is_running(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

fn workload_from_pod(pod: &Pod, service: &str, namespace: &str) -> Workload {
    let labels = pod.labels().clone();
    let server_identity = labels
        .get(SERVER_IDENTITY_LABEL)
        .cloned()
        .unwrap_or_else(|| format_identity(service, namespace));
    let sidecar_present = pod
        .annotations()
        .get(LINKERD_INJECT_ANNOTATION)
        .is_some_and(|v| v == "enabled");
    let spec = pod.spec.as_ref();
    let service_account = spec
        .and_then(|s| s.service_account_name.clone())
        .unwrap_or_else(|| "default".to_string());

    let mut ports: Vec<WorkloadPort> = spec
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            Some(WorkloadPort {
                port: u16::try_from(p.container_port).ok()?,
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            })
        })
        .collect();
    ports.sort();
    ports.dedup();

    Workload {
        name: service.to_string(),
        namespace: namespace.to_string(),
        service_account,
        server_identity,
        sidecar_present,
        ports,
        labels,
    }
}
