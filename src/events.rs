//! Kubernetes Events on ClientIntents
//!
//! Conditions that are not errors (client without pods, unknown target,
//! unmeshed client) are reported as Events so they show up in
//! `kubectl describe clientintents`. Publishing never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for Events about a ClientIntents
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record an event on `resource_ref`; failures are logged and swallowed
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Events are reported as `reporter`, with the pod name as instance
    pub fn new(client: Client, reporter: &str) -> Self {
        let reporter = Reporter {
            controller: reporter.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// No non-terminating pod implements the client service
    pub const PODS_NOT_FOUND: &str = "PodsNotFound";
    /// A call target has no running pods; the call is skipped this pass
    pub const TARGET_NOT_FOUND: &str = "TargetNotFound";
    /// The client pod is not meshed; mesh policies were not created
    pub const MISSING_SIDECAR: &str = "MissingSidecar";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// All enabled backends converged
    pub const POLICIES_APPLIED: &str = "PoliciesApplied";
    /// Artifacts released after the intents were deleted
    pub const POLICIES_REMOVED: &str = "PoliciesRemoved";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Releasing artifacts on deletion
    pub const DELETE: &str = "Delete";
}

/// Publisher that records every event, for assertions in tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingEventPublisher {
    events: std::sync::Mutex<Vec<(EventType, String, Option<String>)>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    /// Reasons recorded so far, in order
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    /// Note of the first event with `reason`
    pub(crate) fn note_for(&self, reason: &str) -> Option<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(_, r, _)| r == reason)
            .and_then(|(_, _, note)| note.clone())
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((type_, reason.to_string(), note));
    }
}
