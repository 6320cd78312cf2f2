//! ClientIntents reconciliation
//!
//! Finalizer state machine: NoFinalizer -> HasFinalizer -> Deleting -> Gone.
//! A new object first gets the finalizer and is requeued; only then are
//! artifacts written, so an object can never disappear while it still owns
//! artifacts. Deletion releases everything, then drops the finalizer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::{has_finalizer, Context};
use crate::backend::{Owner, ReconcilePass};
use crate::crd::{ClientIntents, ClientIntentsStatus};
use crate::events::{actions, reasons};
use crate::Error;

/// Result of reconciling one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Run the key again right away
    pub requeue: bool,
}

impl ReconcileOutcome {
    /// Converged; wait for the next change
    pub const DONE: Self = Self { requeue: false };
    /// Retry the key immediately
    pub const REQUEUE: Self = Self { requeue: true };

    /// Controller action for this outcome
    pub fn into_action(self) -> Action {
        if self.requeue {
            Action::requeue(Duration::ZERO)
        } else {
            Action::await_change()
        }
    }
}

/// Reconcile a ClientIntents delivered by the controller
///
/// The controller hands over its cached copy; [`reconcile_key`] re-reads the
/// object so decisions are taken on current state.
pub async fn reconcile(intents: Arc<ClientIntents>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = ObjectRef::from_obj(intents.as_ref());
    Ok(reconcile_key(&ctx, &key).await?.into_action())
}

/// Reconcile the ClientIntents behind `key`
#[instrument(skip(ctx, key), fields(intents = %key.name, namespace = key.namespace.as_deref().unwrap_or_default()))]
pub async fn reconcile_key(
    ctx: &Context,
    key: &ObjectRef<ClientIntents>,
) -> Result<ReconcileOutcome, Error> {
    let namespace = key.namespace.clone().unwrap_or_default();

    let Some(intents) = ctx.intents.get(&namespace, &key.name).await? else {
        // Gone without passing through our finalizer; the key is all we have
        info!("intents not found, releasing artifacts by key");
        let pass = ctx.new_pass(reference_for_key(key));
        let owner = Owner::from_key(&key.name, &namespace);
        return match release_all(ctx, &pass, &owner).await {
            Ok(0) => {
                warn!(
                    owner = %owner.identity(),
                    "nothing owned under the identity derived from the object name; \
                     artifacts of intents named differently from their service need manual cleanup"
                );
                Ok(ReconcileOutcome::DONE)
            }
            Ok(_) => Ok(ReconcileOutcome::DONE),
            Err(e) if e.is_conflict() => Ok(ReconcileOutcome::REQUEUE),
            Err(e) => Err(e),
        };
    };

    if intents.metadata.deletion_timestamp.is_some() {
        return finalize(ctx, &intents).await;
    }

    if !has_finalizer(&intents) {
        debug!("adding cleanup finalizer");
        return match ctx.intents.add_finalizer(&intents).await {
            Ok(()) => Ok(ReconcileOutcome::REQUEUE),
            Err(e) if e.is_conflict() => Ok(ReconcileOutcome::REQUEUE),
            Err(e) => Err(e),
        };
    }

    match apply(ctx, &intents).await {
        Err(e) if e.is_conflict() => {
            debug!(error = %e, "conflict during reconcile, requeueing");
            Ok(ReconcileOutcome::REQUEUE)
        }
        other => other,
    }
}

/// Converge every enabled backend onto the current spec
async fn apply(ctx: &Context, intents: &ClientIntents) -> Result<ReconcileOutcome, Error> {
    let name = intents.name_any();
    let namespace = intents.namespace_or_default();
    let pass = ctx.new_pass(intents.object_ref(&()));

    if let Err(e) = intents.spec.validate(&name) {
        warn!(error = %e, "intents failed validation");
        pass.publish(
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::RECONCILE,
            e.to_string(),
        )
        .await;
        let status = ClientIntentsStatus::invalid(intents.metadata.generation, &e.to_string());
        update_status(ctx, intents, status).await?;
        return Err(e);
    }

    let client = match pass.resolve_client(intents).await {
        Ok(client) => client,
        Err(e) if e.is_pod_not_found() => {
            let service = intents.service_name();
            warn!(service, "no running pods for client service");
            pass.publish(
                EventType::Warning,
                reasons::PODS_NOT_FOUND,
                actions::RECONCILE,
                format!(
                    "Could not find non-terminating pods for service {service} in namespace {namespace}. \
                     Intents could not be reconciled now, but will be reconciled if pods appear later."
                ),
            )
            .await;
            return Ok(ReconcileOutcome::DONE);
        }
        Err(e) => return Err(e),
    };

    let mut backends = BTreeMap::new();
    let mut writes = 0;
    for manager in &ctx.managers {
        let report = manager.reconcile(&pass, intents, &client).await?;
        debug!(
            backend = %report.backend,
            created = report.sync.created,
            updated = report.sync.updated,
            deleted = report.sync.deleted,
            skipped = report.skipped.as_deref(),
            "backend reconciled"
        );
        writes += report.sync.writes();
        backends.insert(report.backend.as_str().to_string(), report.status());
    }

    let status = ClientIntentsStatus::ready(intents.metadata.generation, backends);
    update_status(ctx, intents, status).await?;

    if writes > 0 {
        info!(writes, "policies applied");
        pass.publish(
            EventType::Normal,
            reasons::POLICIES_APPLIED,
            actions::RECONCILE,
            format!("Applied {writes} policy changes"),
        )
        .await;
    }
    Ok(ReconcileOutcome::DONE)
}

/// Release everything the intents own, then let them go
async fn finalize(ctx: &Context, intents: &ClientIntents) -> Result<ReconcileOutcome, Error> {
    let pass = ctx.new_pass(intents.object_ref(&()));
    let removed = match release_all(ctx, &pass, &Owner::of(intents)).await {
        Ok(removed) => removed,
        Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::REQUEUE),
        Err(e) => return Err(e),
    };

    info!(removed, "intents deleted, artifacts released");
    pass.publish(
        EventType::Normal,
        reasons::POLICIES_REMOVED,
        actions::DELETE,
        format!("Released {removed} policies"),
    )
    .await;

    match ctx.intents.remove_finalizer(intents).await {
        Ok(()) => Ok(ReconcileOutcome::DONE),
        Err(e) if e.is_conflict() => Ok(ReconcileOutcome::REQUEUE),
        Err(e) => Err(e),
    }
}

/// Run `delete_all` on every enabled manager; returns how many artifacts
/// were deleted or handed off
async fn release_all(ctx: &Context, pass: &ReconcilePass, owner: &Owner) -> Result<usize, Error> {
    let mut removed = 0;
    for manager in &ctx.managers {
        let report = manager.delete_all(pass, owner).await?;
        removed += report.deleted + report.handed_off;
    }
    Ok(removed)
}

/// Patch status only when it differs from what is stored
async fn update_status(
    ctx: &Context,
    intents: &ClientIntents,
    status: ClientIntentsStatus,
) -> Result<(), Error> {
    if intents
        .status
        .as_ref()
        .is_some_and(|current| current.same_state(&status))
    {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.intents
        .patch_status(&intents.namespace_or_default(), &intents.name_any(), &status)
        .await
}

fn reference_for_key(key: &ObjectRef<ClientIntents>) -> ObjectReference {
    ObjectReference {
        api_version: Some(ClientIntents::api_version(&()).into_owned()),
        kind: Some(ClientIntents::kind(&()).into_owned()),
        name: Some(key.name.clone()),
        namespace: key.namespace.clone(),
        ..Default::default()
    }
}

/// Error policy for the controller
///
/// Called when reconciliation fails; requeues after the configured delay.
/// Errors that will not go away on their own are logged louder.
pub fn error_policy(intents: Arc<ClientIntents>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(
            error = %error,
            intents = %intents.name_any(),
            "reconciliation failed, retrying"
        );
    } else {
        error!(
            ?error,
            intents = %intents.name_any(),
            "reconciliation failed, waiting for a spec change"
        );
    }
    Action::requeue(ctx.config.requeue_after_error())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::artifact::memory::MemoryStore;
    use crate::artifact::ArtifactKind;
    use crate::backend::test_support::{pod_lister, sample_intents};
    use crate::backend::{ContentHashSuffix, MeshManager, MockPolicyManager, PolicyManager, SegmentationManager};
    use crate::controller::IntentsClient;
    use crate::crd::{Call, CallType, HttpMethod, HttpResource};
    use crate::events::RecordingEventPublisher;
    use crate::identity::format_identity;
    use crate::prerequisites::MockCrdProbe;
    use crate::resolver::tests::sample_pod;
    use crate::INTENTS_FINALIZER;

    /// Intents client backed by one in-memory object, behaving like the API
    /// server for finalizers and status
    #[derive(Default)]
    struct FakeIntents {
        object: Mutex<Option<ClientIntents>>,
        status_patches: Mutex<usize>,
    }

    impl FakeIntents {
        fn holding(intents: ClientIntents) -> Self {
            Self {
                object: Mutex::new(Some(intents)),
                ..Default::default()
            }
        }

        fn current(&self) -> Option<ClientIntents> {
            self.object.lock().unwrap().clone()
        }

        fn status_patches(&self) -> usize {
            *self.status_patches.lock().unwrap()
        }

        fn mark_deleted(&self) {
            if let Some(obj) = self.object.lock().unwrap().as_mut() {
                obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
        }
    }

    #[async_trait::async_trait]
    impl IntentsClient for FakeIntents {
        async fn get(&self, _namespace: &str, _name: &str) -> Result<Option<ClientIntents>, Error> {
            Ok(self.current())
        }

        async fn add_finalizer(&self, _intents: &ClientIntents) -> Result<(), Error> {
            if let Some(obj) = self.object.lock().unwrap().as_mut() {
                obj.metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .push(INTENTS_FINALIZER.to_string());
            }
            Ok(())
        }

        async fn remove_finalizer(&self, _intents: &ClientIntents) -> Result<(), Error> {
            let mut object = self.object.lock().unwrap();
            if let Some(obj) = object.as_mut() {
                obj.metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .retain(|f| f != INTENTS_FINALIZER);
                let finalizers_left = obj.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty());
                if obj.metadata.deletion_timestamp.is_some() && !finalizers_left {
                    *object = None;
                }
            }
            Ok(())
        }

        async fn patch_status(
            &self,
            _namespace: &str,
            _name: &str,
            status: &ClientIntentsStatus,
        ) -> Result<(), Error> {
            *self.status_patches.lock().unwrap() += 1;
            if let Some(obj) = self.object.lock().unwrap().as_mut() {
                obj.status = Some(status.clone());
            }
            Ok(())
        }
    }

    struct Harness {
        ctx: Context,
        intents: Arc<FakeIntents>,
        store: Arc<MemoryStore>,
        events: Arc<RecordingEventPublisher>,
    }

    fn harness(
        intents: ClientIntents,
        pods: Vec<k8s_openapi::api::core::v1::Pod>,
        managers: Vec<Arc<dyn PolicyManager>>,
    ) -> Harness {
        let fake = Arc::new(FakeIntents::holding(intents));
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingEventPublisher::default());
        let mut probe = MockCrdProbe::new();
        probe.expect_crd_exists().returning(|_| Ok(true));
        let ctx = Context::for_testing(
            fake.clone(),
            Arc::new(probe),
            Arc::new(pod_lister(pods)),
            store.clone(),
            events.clone(),
            managers,
        );
        Harness {
            ctx,
            intents: fake,
            store,
            events,
        }
    }

    fn default_managers() -> Vec<Arc<dyn PolicyManager>> {
        vec![
            Arc::new(SegmentationManager::new()),
            Arc::new(MeshManager::new("cluster.local", Arc::new(ContentHashSuffix))),
        ]
    }

    fn checkout_intents() -> ClientIntents {
        sample_intents(
            "checkout",
            "shop",
            vec![Call {
                name: "payments".to_string(),
                namespace: Some("billing".to_string()),
                call_type: CallType::Http,
                http_resources: vec![HttpResource {
                    path: "/charge".to_string(),
                    methods: vec![HttpMethod::Post],
                }],
                ..Default::default()
            }],
        )
    }

    fn checkout_pods() -> Vec<k8s_openapi::api::core::v1::Pod> {
        vec![
            sample_pod(
                "checkout-1",
                "shop",
                Some(&format_identity("checkout", "shop")),
                &[8080],
                true,
            ),
            sample_pod(
                "payments-1",
                "billing",
                Some(&format_identity("payments", "billing")),
                &[8443],
                true,
            ),
        ]
    }

    fn key() -> ObjectRef<ClientIntents> {
        ObjectRef::new("checkout").within("shop")
    }

    fn with_finalizer(mut intents: ClientIntents) -> ClientIntents {
        intents.metadata.finalizers = Some(vec![INTENTS_FINALIZER.to_string()]);
        intents
    }

    // =========================================================================
    // Lifecycle stories
    // =========================================================================

    #[tokio::test]
    async fn story_new_intents_converge_then_settle() {
        let h = harness(checkout_intents(), checkout_pods(), default_managers());

        // First pass only claims the object
        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::REQUEUE);
        assert!(has_finalizer(&h.intents.current().unwrap()));
        assert!(h.store.all().is_empty());

        // Second pass writes policies and status
        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DONE);
        assert_eq!(h.store.of_kind(ArtifactKind::CiliumNetworkPolicy).len(), 1);
        assert_eq!(h.store.of_kind(ArtifactKind::HttpRoute).len(), 1);
        let status = h.intents.current().unwrap().status.unwrap();
        assert!(status.up_to_date);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.backends["mesh"].applied_artifacts, 4);
        assert_eq!(status.backends["segmentation"].applied_artifacts, 1);
        assert_eq!(h.events.reasons(), vec![reasons::POLICIES_APPLIED]);

        // Third pass changes nothing anywhere
        h.store.reset_writes();
        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DONE);
        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.intents.status_patches(), 1);
        assert_eq!(h.events.reasons().len(), 1);
    }

    #[tokio::test]
    async fn story_deletion_releases_then_drops_finalizer() {
        let h = harness(checkout_intents(), checkout_pods(), default_managers());
        reconcile_key(&h.ctx, &key()).await.unwrap();
        reconcile_key(&h.ctx, &key()).await.unwrap();
        assert!(!h.store.all().is_empty());

        h.intents.mark_deleted();
        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DONE);
        assert!(h.store.all().is_empty());
        assert!(h.intents.current().is_none());
        assert!(h.events.reasons().contains(&reasons::POLICIES_REMOVED.to_string()));
    }

    #[tokio::test]
    async fn missing_object_is_released_by_key() {
        let h = harness(checkout_intents(), checkout_pods(), default_managers());
        reconcile_key(&h.ctx, &key()).await.unwrap();
        reconcile_key(&h.ctx, &key()).await.unwrap();
        assert!(!h.store.all().is_empty());

        // Object vanished without our finalizer running
        *h.intents.object.lock().unwrap() = None;
        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DONE);
        assert!(h.store.all().is_empty());
    }

    #[tokio::test]
    async fn vanished_object_named_apart_from_its_service_keeps_artifacts() {
        let mut intents = checkout_intents();
        intents.metadata.name = Some("checkout-intents".to_string());
        let h = harness(intents, checkout_pods(), default_managers());
        let renamed = ObjectRef::new("checkout-intents").within("shop");
        reconcile_key(&h.ctx, &renamed).await.unwrap();
        reconcile_key(&h.ctx, &renamed).await.unwrap();
        let before = h.store.all().len();
        assert!(before > 0);

        *h.intents.object.lock().unwrap() = None;
        h.store.reset_writes();
        let outcome = reconcile_key(&h.ctx, &renamed).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DONE);
        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.store.all().len(), before);
    }

    // =========================================================================
    // Error handling
    // =========================================================================

    #[tokio::test]
    async fn missing_client_pods_publish_event_without_requeue() {
        let h = harness(
            with_finalizer(checkout_intents()),
            vec![],
            default_managers(),
        );
        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DONE);
        assert_eq!(h.events.reasons(), vec![reasons::PODS_NOT_FOUND]);
        assert_eq!(
            h.events.note_for(reasons::PODS_NOT_FOUND).unwrap(),
            "Could not find non-terminating pods for service checkout in namespace shop. \
             Intents could not be reconciled now, but will be reconciled if pods appear later."
        );
        assert!(h.store.all().is_empty());
    }

    #[tokio::test]
    async fn invalid_spec_sets_status_and_fails() {
        let mut intents = with_finalizer(checkout_intents());
        intents.spec.calls[0].http_resources[0].path = "charge".to_string();
        let h = harness(intents, checkout_pods(), default_managers());

        let err = reconcile_key(&h.ctx, &key()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(h.events.reasons(), vec![reasons::VALIDATION_FAILED]);
        let status = h.intents.current().unwrap().status.unwrap();
        assert!(!status.up_to_date);
        assert_eq!(status.conditions[0].reason, "ValidationFailed");
        assert!(h.store.all().is_empty());
    }

    #[tokio::test]
    async fn conflict_requeues_without_error() {
        let mut manager = MockPolicyManager::new();
        manager
            .expect_reconcile()
            .returning(|_, _, _| Err(Error::conflict("Server", "server-for-payments-port-8443", "changed")));
        let h = harness(
            with_finalizer(checkout_intents()),
            checkout_pods(),
            vec![Arc::new(manager)],
        );

        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::REQUEUE);
        assert_eq!(h.intents.status_patches(), 0);
    }

    #[tokio::test]
    async fn first_failing_backend_aborts_the_pass() {
        let mut failing = MockPolicyManager::new();
        failing
            .expect_reconcile()
            .returning(|_, _, _| Err(Error::internal_with_context("artifact-store", "boom")));
        let mut never = MockPolicyManager::new();
        never.expect_reconcile().never();
        let h = harness(
            with_finalizer(checkout_intents()),
            checkout_pods(),
            vec![Arc::new(failing), Arc::new(never)],
        );

        let err = reconcile_key(&h.ctx, &key()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.intents.status_patches(), 0);
    }

    #[tokio::test]
    async fn deletion_conflict_keeps_finalizer() {
        let mut manager = MockPolicyManager::new();
        manager
            .expect_delete_all()
            .returning(|_, _| Err(Error::conflict("Server", "shared", "relabel raced")));
        let intents = with_finalizer(checkout_intents());
        let h = harness(intents, checkout_pods(), vec![Arc::new(manager)]);
        h.intents.mark_deleted();

        let outcome = reconcile_key(&h.ctx, &key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::REQUEUE);
        assert!(has_finalizer(&h.intents.current().unwrap()));
    }

    #[test]
    fn outcome_maps_to_controller_action() {
        assert_eq!(
            ReconcileOutcome::REQUEUE.into_action(),
            Action::requeue(Duration::ZERO)
        );
        assert_eq!(ReconcileOutcome::DONE.into_action(), Action::await_change());
    }

    #[test]
    fn error_policy_uses_configured_delay() {
        let h = harness(checkout_intents(), vec![], vec![]);
        let ctx = Arc::new(h.ctx);
        let action = error_policy(
            Arc::new(checkout_intents()),
            &Error::internal_with_context("test", "boom"),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(ctx.config.requeue_after_error()));
    }
}
