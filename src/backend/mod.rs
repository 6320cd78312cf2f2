//! Policy backends
//!
//! Each backend turns the calls of a ClientIntents into the artifacts one
//! enforcement technology understands. Backends form a closed set with a
//! fixed reconcile order; the controller builds the enabled ones from
//! configuration at startup and drives them through [`PolicyManager`].
//!
//! Backends only compute desired state. Writing it, sharing equivalent
//! artifacts and cleaning up is the [`ArtifactEngine`]'s job, so every
//! backend gets the same ownership and shared-artifact guarantees.

mod broker;
mod cloud_iam;
mod mesh;
mod segmentation;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::artifact::{Artifact, ArtifactEngine, ArtifactKind, SyncReport};
use crate::config::EnforcementConfig;
use crate::crd::{BackendStatus, CallType, ClientIntents};
use crate::events::{actions, reasons, EventPublisher};
use crate::identity::format_identity;
use crate::prerequisites::{CrdProbe, PrerequisiteCache, Technology};
use crate::resolver::{ResolvedCall, ServiceIdentityResolver, Workload};
use crate::Error;

pub use broker::BrokerManager;
pub use cloud_iam::CloudIamManager;
pub use mesh::{ContentHashSuffix, MeshManager, SuffixSource};
pub use segmentation::SegmentationManager;

/// Reason recorded when a backend's technology is not installed
pub const SKIPPED_NOT_INSTALLED: &str = "NotInstalled";

/// Enforcement backends, in reconcile order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    /// L4 network segmentation (Cilium)
    Segmentation,
    /// Service mesh mTLS authorization (Linkerd)
    Mesh,
    /// Message broker ACLs (Strimzi)
    Broker,
    /// Cloud IAM (ACK)
    CloudIam,
}

impl Backend {
    /// Every backend in reconcile order
    pub const ALL: [Backend; 4] = [
        Backend::Segmentation,
        Backend::Mesh,
        Backend::Broker,
        Backend::CloudIam,
    ];

    /// Key used in status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::Mesh => "mesh",
            Self::Broker => "broker",
            Self::CloudIam => "cloudIam",
        }
    }

    /// Technology that must be installed for the backend to write anything
    pub fn technology(&self) -> Technology {
        match self {
            Self::Segmentation => Technology::Cilium,
            Self::Mesh => Technology::Linkerd,
            Self::Broker => Technology::Strimzi,
            Self::CloudIam => Technology::AckIam,
        }
    }

    /// Artifact kinds the backend owns
    pub fn kinds(&self) -> &'static [ArtifactKind] {
        match self {
            Self::Segmentation => &[ArtifactKind::CiliumNetworkPolicy],
            Self::Mesh => &[
                ArtifactKind::Server,
                ArtifactKind::MeshTlsAuthentication,
                ArtifactKind::HttpRoute,
                ArtifactKind::AuthorizationPolicy,
            ],
            Self::Broker => &[ArtifactKind::KafkaUser],
            Self::CloudIam => &[ArtifactKind::IamPolicy, ArtifactKind::IamRole],
        }
    }

    /// Call types whose targets must resolve to in-cluster workloads
    pub fn resolved_call_types(&self) -> &'static [CallType] {
        match self {
            Self::Segmentation => &[CallType::Generic, CallType::Http, CallType::Kafka],
            Self::Mesh => &[CallType::Generic, CallType::Http],
            Self::Broker | Self::CloudIam => &[],
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner identity of a set of artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    identity: String,
}

impl Owner {
    /// Owner for a live ClientIntents
    pub fn of(intents: &ClientIntents) -> Self {
        Self {
            identity: intents.client_identity(),
        }
    }

    /// Owner derived from an object key alone, for intents that are gone.
    ///
    /// The object name stands in for the service name; they are equal by
    /// convention. Intents deleted through the finalizer never need this.
    pub fn from_key(name: &str, namespace: &str) -> Self {
        Self {
            identity: format_identity(name, namespace),
        }
    }

    /// Ownership label value
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

/// Outcome of one backend for one pass
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReport {
    /// Backend that produced the report
    pub backend: Backend,
    /// Engine activity
    pub sync: SyncReport,
    /// Client is not meshed
    pub missing_sidecar: bool,
    /// Why the backend did nothing
    pub skipped: Option<String>,
}

impl BackendReport {
    /// Report for a backend that converged
    pub fn applied(backend: Backend, sync: SyncReport) -> Self {
        Self {
            backend,
            sync,
            missing_sidecar: false,
            skipped: None,
        }
    }

    /// Report for a backend that did not run
    pub fn skipped(backend: Backend, reason: &str) -> Self {
        Self {
            backend,
            sync: SyncReport::default(),
            missing_sidecar: false,
            skipped: Some(reason.to_string()),
        }
    }

    /// Status entry for this backend
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            applied_artifacts: u32::try_from(self.sync.applied()).unwrap_or(u32::MAX),
            missing_sidecar: self.missing_sidecar,
            skipped: self.skipped.clone(),
        }
    }
}

/// Outcome of resolving the targets of a backend's calls
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetResolution {
    /// Calls whose target has running pods
    pub resolved: Vec<ResolvedCall>,
    /// Calls skipped this pass because their target has no running pods
    pub unresolved: usize,
}

impl TargetResolution {
    /// Whether every call resolved
    pub fn is_complete(&self) -> bool {
        self.unresolved == 0
    }
}

/// State shared by every backend during one reconcile of one ClientIntents.
///
/// Created fresh per pass: nothing here outlives it.
pub struct ReconcilePass {
    prerequisites: PrerequisiteCache,
    resolver: ServiceIdentityResolver,
    engine: ArtifactEngine,
    events: Arc<dyn EventPublisher>,
    object_ref: ObjectReference,
    targets: DashMap<(String, String), Option<Workload>>,
}

impl ReconcilePass {
    /// Start a pass for the object behind `object_ref`
    pub fn new(
        probe: Arc<dyn CrdProbe>,
        resolver: ServiceIdentityResolver,
        engine: ArtifactEngine,
        events: Arc<dyn EventPublisher>,
        object_ref: ObjectReference,
    ) -> Self {
        Self {
            prerequisites: PrerequisiteCache::new(probe),
            resolver,
            engine,
            events,
            object_ref,
            targets: DashMap::new(),
        }
    }

    /// Artifact engine for this pass
    pub fn engine(&self) -> &ArtifactEngine {
        &self.engine
    }

    /// Whether a technology is installed (cached for the pass)
    pub async fn is_installed(&self, technology: Technology) -> Result<bool, Error> {
        self.prerequisites.is_installed(technology).await
    }

    /// Resolve the calling workload
    pub async fn resolve_client(&self, intents: &ClientIntents) -> Result<Workload, Error> {
        self.resolver
            .resolve(intents.service_name(), &intents.namespace_or_default())
            .await
    }

    /// Resolve the targets of calls of the given types.
    ///
    /// A target without running pods is reported once per pass and its calls
    /// are skipped; the pod watch brings the intents back when it appears.
    pub async fn resolve_targets(
        &self,
        intents: &ClientIntents,
        types: &[CallType],
    ) -> Result<TargetResolution, Error> {
        let namespace = intents.namespace_or_default();
        let mut resolution = TargetResolution::default();
        for call in intents.calls_of(types) {
            let target_ns = call.target_namespace(&namespace).to_string();
            let key = (call.name.clone(), target_ns.clone());
            let cached = self.targets.get(&key).map(|w| w.value().clone());
            let workload = match cached {
                Some(workload) => workload,
                None => {
                    let workload = match self.resolver.resolve(&call.name, &target_ns).await {
                        Ok(workload) => Some(workload),
                        Err(e) if e.is_pod_not_found() => {
                            warn!(
                                target = %call.name,
                                namespace = %target_ns,
                                "call target has no running pods, skipping"
                            );
                            self.publish(
                                EventType::Warning,
                                reasons::TARGET_NOT_FOUND,
                                actions::RECONCILE,
                                format!(
                                    "Could not find non-terminating pods for target service {} in namespace {}. \
                                     Calls to it will be enforced once pods appear.",
                                    call.name, target_ns
                                ),
                            )
                            .await;
                            None
                        }
                        Err(e) => return Err(e),
                    };
                    self.targets.insert(key, workload.clone());
                    workload
                }
            };
            match workload {
                Some(workload) => resolution.resolved.push(ResolvedCall {
                    call: call.clone(),
                    workload,
                }),
                None => resolution.unresolved += 1,
            }
        }
        Ok(resolution)
    }

    /// Publish an event on the ClientIntents being reconciled
    pub async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.events
            .publish(&self.object_ref, type_, reason, action, Some(note))
            .await;
    }
}

/// One enforcement backend.
///
/// `compute_desired` is pure: the same intents, client and targets always
/// produce the same artifacts. `reconcile` and `delete_all` are effectful and
/// must be idempotent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyManager: Send + Sync {
    /// Which backend this is
    fn backend(&self) -> Backend;

    /// Artifacts the intents require from this backend
    fn compute_desired(
        &self,
        intents: &ClientIntents,
        client: &Workload,
        targets: &[ResolvedCall],
    ) -> Result<Vec<Artifact>, Error>;

    /// Converge this backend's artifacts for the intents
    async fn reconcile(
        &self,
        pass: &ReconcilePass,
        intents: &ClientIntents,
        client: &Workload,
    ) -> Result<BackendReport, Error>;

    /// Release every artifact this backend holds for `owner`
    async fn delete_all(&self, pass: &ReconcilePass, owner: &Owner) -> Result<SyncReport, Error>;
}

/// Shared reconcile flow: prerequisite check, target resolution, desired
/// state, convergence.
pub(crate) async fn converge_backend<M: PolicyManager + ?Sized>(
    manager: &M,
    pass: &ReconcilePass,
    intents: &ClientIntents,
    client: &Workload,
) -> Result<BackendReport, Error> {
    let backend = manager.backend();
    if !pass.is_installed(backend.technology()).await? {
        debug!(backend = %backend, "technology not installed, skipping");
        return Ok(BackendReport::skipped(backend, SKIPPED_NOT_INSTALLED));
    }

    let targets = match backend.resolved_call_types() {
        [] => TargetResolution::default(),
        types => pass.resolve_targets(intents, types).await?,
    };
    let desired = manager.compute_desired(intents, client, &targets.resolved)?;
    let owner = Owner::of(intents);

    // Artifacts of a skipped call are still wanted; with any call skipped the
    // owned set cannot be told apart from stale, so nothing is collected.
    let sync = if targets.is_complete() {
        pass.engine()
            .converge(owner.identity(), backend.kinds(), desired)
            .await?
    } else {
        debug!(
            backend = %backend,
            unresolved = targets.unresolved,
            "call targets unresolved, keeping existing artifacts"
        );
        pass.engine().apply_only(owner.identity(), desired).await?
    };
    debug!(backend = %backend, ?sync, "backend converged");
    Ok(BackendReport::applied(backend, sync))
}

/// Shared delete flow
pub(crate) async fn release_backend(
    backend: Backend,
    pass: &ReconcilePass,
    owner: &Owner,
) -> Result<SyncReport, Error> {
    if !pass.is_installed(backend.technology()).await? {
        return Ok(SyncReport::default());
    }
    pass.engine()
        .release_all(owner.identity(), backend.kinds())
        .await
}

/// Build the enabled managers in reconcile order
pub fn build_managers(config: &EnforcementConfig) -> Result<Vec<Arc<dyn PolicyManager>>, Error> {
    config.validate()?;
    config
        .enabled_backends()
        .into_iter()
        .map(|backend| -> Result<Arc<dyn PolicyManager>, Error> {
            Ok(match backend {
                Backend::Segmentation => Arc::new(SegmentationManager::new()),
                Backend::Mesh => Arc::new(MeshManager::new(
                    &config.linkerd_trust_domain,
                    Arc::new(ContentHashSuffix),
                )),
                Backend::Broker => Arc::new(BrokerManager::new()),
                Backend::CloudIam => {
                    let arn = config.aws_oidc_provider_arn.as_deref().ok_or_else(|| {
                        Error::config("--enable-aws-policy requires --aws-oidc-provider-arn")
                    })?;
                    Arc::new(CloudIamManager::new(arn))
                }
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures shared by the backend tests

    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Pod;

    use super::*;
    use crate::artifact::memory::MemoryStore;
    use crate::crd::{Call, ClientIntentsSpec, ServiceRef};
    use crate::events::RecordingEventPublisher;
    use crate::prerequisites::MockCrdProbe;
    use crate::resolver::{MockWorkloadClient, WorkloadPort};

    pub(crate) fn sample_intents(service: &str, namespace: &str, calls: Vec<Call>) -> ClientIntents {
        let mut intents = ClientIntents::new(
            service,
            ClientIntentsSpec {
                service: ServiceRef {
                    name: service.to_string(),
                },
                calls,
            },
        );
        intents.metadata.namespace = Some(namespace.to_string());
        intents.metadata.generation = Some(1);
        intents
    }

    pub(crate) fn sample_workload(service: &str, namespace: &str, ports: &[u16]) -> Workload {
        Workload {
            name: service.to_string(),
            namespace: namespace.to_string(),
            service_account: service.to_string(),
            server_identity: format_identity(service, namespace),
            sidecar_present: true,
            ports: ports
                .iter()
                .map(|p| WorkloadPort {
                    port: *p,
                    protocol: "TCP".to_string(),
                })
                .collect(),
            labels: BTreeMap::new(),
        }
    }

    pub(crate) fn resolved(call: Call, workload: Workload) -> ResolvedCall {
        ResolvedCall { call, workload }
    }

    /// Pass over an in-memory store with every technology installed and no
    /// pods anywhere
    pub(crate) fn memory_pass(
        store: Arc<MemoryStore>,
        events: Arc<RecordingEventPublisher>,
        installed: bool,
    ) -> ReconcilePass {
        let mut probe = MockCrdProbe::new();
        probe.expect_crd_exists().returning(move |_| Ok(installed));
        let mut pods = MockWorkloadClient::new();
        pods.expect_list_pods().returning(|_, _| Ok(vec![]));
        ReconcilePass::new(
            Arc::new(probe),
            ServiceIdentityResolver::new(Arc::new(pods)),
            ArtifactEngine::new(store),
            events,
            ObjectReference::default(),
        )
    }

    /// Pass over an in-memory store with every technology installed, listing
    /// `pods` the way the API server would filter them
    pub(crate) fn pod_pass(
        store: Arc<MemoryStore>,
        events: Arc<RecordingEventPublisher>,
        pods: Vec<Pod>,
    ) -> ReconcilePass {
        let mut probe = MockCrdProbe::new();
        probe.expect_crd_exists().returning(|_| Ok(true));
        ReconcilePass::new(
            Arc::new(probe),
            ServiceIdentityResolver::new(Arc::new(pod_lister(pods))),
            ArtifactEngine::new(store),
            events,
            ObjectReference::default(),
        )
    }

    /// Mock pod lister filtering by namespace and `key=value` selector
    pub(crate) fn pod_lister(pods: Vec<Pod>) -> MockWorkloadClient {
        let mut lister = MockWorkloadClient::new();
        lister
            .expect_list_pods()
            .returning(move |namespace, selector| {
                Ok(pods
                    .iter()
                    .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
                    .filter(|p| match selector.as_deref().and_then(|s| s.split_once('=')) {
                        Some((key, value)) => p
                            .metadata
                            .labels
                            .as_ref()
                            .and_then(|l| l.get(key))
                            .is_some_and(|v| v == value),
                        None => true,
                    })
                    .cloned()
                    .collect())
            });
        lister
    }
}
