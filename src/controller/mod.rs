//! Controller for ClientIntents
//!
//! Reconciles each ClientIntents through the enabled policy backends and
//! keeps the finalizer that guarantees artifacts are released when the
//! intents are deleted. Controllers follow the Kubernetes controller pattern
//! with observe-diff-act loops; every step is idempotent.

mod intents;
mod runner;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::artifact::{ArtifactEngine, ArtifactStore, KubeArtifactStore};
use crate::backend::{build_managers, PolicyManager, ReconcilePass};
use crate::config::EnforcementConfig;
use crate::crd::{ClientIntents, ClientIntentsStatus};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::prerequisites::{CrdProbe, KubeCrdProbe};
use crate::resolver::{KubeWorkloadClient, ServiceIdentityResolver, WorkloadClient};
use crate::{Error, FIELD_MANAGER, INTENTS_FINALIZER};

pub use intents::{error_policy, reconcile, reconcile_key, ReconcileOutcome};
pub use runner::{build_controllers, intents_for_pod, watch_scopes, WatchScope};

/// Trait abstracting ClientIntents API operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IntentsClient: Send + Sync {
    /// Fetch the current state of a ClientIntents, `None` if it is gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ClientIntents>, Error>;

    /// Add the cleanup finalizer at the object's resourceVersion
    async fn add_finalizer(&self, intents: &ClientIntents) -> Result<(), Error>;

    /// Remove the cleanup finalizer at the object's resourceVersion
    async fn remove_finalizer(&self, intents: &ClientIntents) -> Result<(), Error>;

    /// Patch the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ClientIntentsStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeIntentsClient {
    client: Client,
}

impl KubeIntentsClient {
    /// Create a new KubeIntentsClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ClientIntents> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Merge-patch the finalizer list. Carrying the resourceVersion makes a
    /// stale read fail with 409 instead of clobbering another writer.
    async fn patch_finalizers(
        &self,
        intents: &ClientIntents,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": intents.resource_version(),
            }
        });
        self.api(&intents.namespace_or_default())
            .patch(
                &intents.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IntentsClient for KubeIntentsClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ClientIntents>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn add_finalizer(&self, intents: &ClientIntents) -> Result<(), Error> {
        if has_finalizer(intents) {
            return Ok(());
        }
        let mut finalizers = intents.finalizers().to_vec();
        finalizers.push(INTENTS_FINALIZER.to_string());
        self.patch_finalizers(intents, finalizers).await
    }

    async fn remove_finalizer(&self, intents: &ClientIntents) -> Result<(), Error> {
        if !has_finalizer(intents) {
            return Ok(());
        }
        let finalizers = intents
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != INTENTS_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(intents, finalizers).await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ClientIntentsStatus,
    ) -> Result<(), Error> {
        let status_patch = json!({ "status": status });
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }
}

/// Whether the intents carry the cleanup finalizer
pub fn has_finalizer(intents: &ClientIntents) -> bool {
    intents.finalizers().iter().any(|f| f == INTENTS_FINALIZER)
}

/// Controller context shared across reconciles
///
/// Holds only long-lived clients and the manager collection. Per-pass state
/// (prerequisite answers, resolved targets) lives in a [`ReconcilePass`]
/// created by [`Context::new_pass`].
pub struct Context {
    /// ClientIntents API operations
    pub intents: Arc<dyn IntentsClient>,
    /// CRD existence checks for backend prerequisites
    pub probe: Arc<dyn CrdProbe>,
    /// Pod listing for identity resolution
    pub workloads: Arc<dyn WorkloadClient>,
    /// Persistence for backend artifacts
    pub store: Arc<dyn ArtifactStore>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Enabled backends in reconcile order
    pub managers: Vec<Arc<dyn PolicyManager>>,
    /// Operator configuration
    pub config: EnforcementConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: EnforcementConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Start a reconcile pass for the object behind `object_ref`
    pub fn new_pass(&self, object_ref: ObjectReference) -> ReconcilePass {
        ReconcilePass::new(
            self.probe.clone(),
            ServiceIdentityResolver::new(self.workloads.clone()),
            ArtifactEngine::new(self.store.clone()),
            self.events.clone(),
            object_ref,
        )
    }

    /// Create a context for testing with custom clients
    ///
    /// This method is primarily for unit tests where a real Kubernetes
    /// client is not available. For production code, use [`Context::builder`].
    #[cfg(test)]
    pub(crate) fn for_testing(
        intents: Arc<dyn IntentsClient>,
        probe: Arc<dyn CrdProbe>,
        workloads: Arc<dyn WorkloadClient>,
        store: Arc<dyn ArtifactStore>,
        events: Arc<dyn EventPublisher>,
        managers: Vec<Arc<dyn PolicyManager>>,
    ) -> Self {
        Self {
            intents,
            probe,
            workloads,
            store,
            events,
            managers,
            config: EnforcementConfig::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client, config)
///     .artifact_store(Arc::new(store))
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    config: EnforcementConfig,
    intents: Option<Arc<dyn IntentsClient>>,
    probe: Option<Arc<dyn CrdProbe>>,
    workloads: Option<Arc<dyn WorkloadClient>>,
    store: Option<Arc<dyn ArtifactStore>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, config: EnforcementConfig) -> Self {
        Self {
            client,
            config,
            intents: None,
            probe: None,
            workloads: None,
            store: None,
            events: None,
        }
    }

    /// Override the ClientIntents client
    pub fn intents_client(mut self, intents: Arc<dyn IntentsClient>) -> Self {
        self.intents = Some(intents);
        self
    }

    /// Override the CRD probe
    pub fn crd_probe(mut self, probe: Arc<dyn CrdProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Override the pod lister
    pub fn workload_client(mut self, workloads: Arc<dyn WorkloadClient>) -> Self {
        self.workloads = Some(workloads);
        self
    }

    /// Override the artifact store
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context, constructing the enabled managers from config
    pub fn build(self) -> Result<Context, Error> {
        let managers = build_managers(&self.config)?;
        let client = self.client;
        Ok(Context {
            intents: self
                .intents
                .unwrap_or_else(|| Arc::new(KubeIntentsClient::new(client.clone()))),
            probe: self
                .probe
                .unwrap_or_else(|| Arc::new(KubeCrdProbe::new(client.clone()))),
            workloads: self
                .workloads
                .unwrap_or_else(|| Arc::new(KubeWorkloadClient::new(client.clone()))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeArtifactStore::new(client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER))
            }),
            managers,
            config: self.config,
        })
    }
}
