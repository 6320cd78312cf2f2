//! Owned artifacts: backend policy resources tracked by ownership label
//!
//! Every backend compiles ClientIntents into Kubernetes custom resources.
//! The engine handles them uniformly as [`Artifact`]s: a kind, a name, the
//! labels that locate them, and the `spec` that carries their functional
//! fields. Artifacts never store a back-reference to the intents that
//! produced them; the ownership label is the only link.

mod engine;
#[cfg(test)]
pub(crate) mod memory;
mod store;

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::Value;

use crate::kube_utils::build_api_resource;
use crate::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE, OWNER_IDENTITY_LABEL};

pub use engine::{ArtifactEngine, SyncReport};
pub use store::{ArtifactStore, KubeArtifactStore};

#[cfg(test)]
pub use store::MockArtifactStore;

/// Linkerd policy API group
const LINKERD_POLICY_GROUP: &str = "policy.linkerd.io";

/// Resource kinds the backends produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    /// CiliumNetworkPolicy (cilium.io)
    CiliumNetworkPolicy,
    /// Linkerd Server (policy.linkerd.io)
    Server,
    /// Linkerd MeshTLSAuthentication (policy.linkerd.io)
    MeshTlsAuthentication,
    /// Linkerd HTTPRoute (policy.linkerd.io)
    HttpRoute,
    /// Linkerd AuthorizationPolicy (policy.linkerd.io)
    AuthorizationPolicy,
    /// Strimzi KafkaUser (kafka.strimzi.io)
    KafkaUser,
    /// ACK IAM Policy (iam.services.k8s.aws)
    IamPolicy,
    /// ACK IAM Role (iam.services.k8s.aws)
    IamRole,
}

impl ArtifactKind {
    /// API version the artifacts are written with
    pub const fn api_version(&self) -> &'static str {
        match self {
            Self::CiliumNetworkPolicy => "cilium.io/v2",
            Self::Server => "policy.linkerd.io/v1beta3",
            Self::HttpRoute => "policy.linkerd.io/v1beta3",
            Self::MeshTlsAuthentication | Self::AuthorizationPolicy => {
                "policy.linkerd.io/v1alpha1"
            }
            Self::KafkaUser => "kafka.strimzi.io/v1beta2",
            Self::IamPolicy | Self::IamRole => "iam.services.k8s.aws/v1alpha1",
        }
    }

    /// Kubernetes Kind string
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::CiliumNetworkPolicy => "CiliumNetworkPolicy",
            Self::Server => "Server",
            Self::MeshTlsAuthentication => "MeshTLSAuthentication",
            Self::HttpRoute => "HTTPRoute",
            Self::AuthorizationPolicy => "AuthorizationPolicy",
            Self::KafkaUser => "KafkaUser",
            Self::IamPolicy => "Policy",
            Self::IamRole => "Role",
        }
    }

    fn plural(&self) -> &'static str {
        match self {
            Self::CiliumNetworkPolicy => "ciliumnetworkpolicies",
            Self::Server => "servers",
            Self::MeshTlsAuthentication => "meshtlsauthentications",
            Self::HttpRoute => "httproutes",
            Self::AuthorizationPolicy => "authorizationpolicies",
            Self::KafkaUser => "kafkausers",
            Self::IamPolicy => "policies",
            Self::IamRole => "roles",
        }
    }

    /// ApiResource for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(self.api_version(), self.kind_str(), Some(self.plural()))
    }

    /// Order in which artifacts are written: referenced kinds first.
    ///
    /// Deletion runs in the reverse order so nothing is left pointing at a
    /// removed artifact.
    pub fn apply_rank(&self) -> u8 {
        match self {
            Self::Server
            | Self::MeshTlsAuthentication
            | Self::IamPolicy
            | Self::CiliumNetworkPolicy
            | Self::KafkaUser => 0,
            Self::HttpRoute => 1,
            Self::AuthorizationPolicy | Self::IamRole => 2,
        }
    }

    /// Kinds that several intents may converge on and share.
    ///
    /// An existing artifact of a shareable kind with equivalent functional
    /// fields satisfies a desired one even under a different name.
    pub fn is_shareable(&self) -> bool {
        matches!(self, Self::Server | Self::HttpRoute)
    }

    /// Map a policy reference (group + kind) back to an artifact kind
    pub fn from_reference(group: &str, kind: &str) -> Option<Self> {
        match (group, kind) {
            (LINKERD_POLICY_GROUP, "Server") => Some(Self::Server),
            (LINKERD_POLICY_GROUP, "HTTPRoute") => Some(Self::HttpRoute),
            (LINKERD_POLICY_GROUP, "MeshTLSAuthentication") => Some(Self::MeshTlsAuthentication),
            _ => None,
        }
    }

    /// JSON pointers (into `spec`) of the objects that reference other
    /// artifacts, with the referenced kind when the object doesn't name it.
    fn reference_slots(&self, spec: &Value) -> Vec<(String, Option<ArtifactKind>)> {
        let indexed = |field: &str, suffix: &str, fixed: Option<ArtifactKind>| {
            let len = spec
                .get(field)
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            (0..len)
                .map(|i| (format!("/{field}/{i}{suffix}"), fixed))
                .collect::<Vec<_>>()
        };
        match self {
            Self::HttpRoute => indexed("parentRefs", "", None),
            Self::AuthorizationPolicy => {
                let mut slots = vec![("/targetRef".to_string(), None)];
                slots.extend(indexed("requiredAuthenticationRefs", "", None));
                slots
            }
            Self::IamRole => indexed("policyRefs", "/from", Some(Self::IamPolicy)),
            _ => vec![],
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_str())
    }
}

/// Unique address of an artifact in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    /// Artifact kind
    pub kind: ArtifactKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A backend policy resource as seen by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Resource kind
    pub kind: ArtifactKind,
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels, including the ownership label once written
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Functional fields
    pub spec: Value,
    /// Version observed when read from the cluster; `None` for desired state
    pub resource_version: Option<String>,
}

impl Artifact {
    /// Build an artifact from compiled metadata and spec
    pub fn new(
        kind: ArtifactKind,
        metadata: crate::kube_utils::ObjectMeta,
        spec: Value,
    ) -> Self {
        Self {
            kind,
            name: metadata.name,
            namespace: metadata.namespace,
            labels: metadata.labels,
            annotations: metadata.annotations,
            spec,
            resource_version: None,
        }
    }

    /// Address of this artifact
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Identity of the owning intents, if labeled
    pub fn owner(&self) -> Option<&str> {
        self.labels.get(OWNER_IDENTITY_LABEL).map(String::as_str)
    }

    /// Set the ownership label
    pub fn with_owner(mut self, identity: &str) -> Self {
        self.set_owner(identity);
        self
    }

    /// Set the ownership label in place
    pub fn set_owner(&mut self, identity: &str) {
        self.labels
            .insert(OWNER_IDENTITY_LABEL.to_string(), identity.to_string());
        self.labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_VALUE.to_string(),
        );
    }

    /// Artifacts this one points at (same namespace unless stated)
    pub fn references(&self) -> Vec<ArtifactKey> {
        self.kind
            .reference_slots(&self.spec)
            .into_iter()
            .filter_map(|(pointer, fixed)| {
                let obj = self.spec.pointer(&pointer)?;
                let kind = match fixed {
                    Some(kind) => kind,
                    None => ArtifactKind::from_reference(
                        obj.get("group").and_then(Value::as_str).unwrap_or_default(),
                        obj.get("kind").and_then(Value::as_str)?,
                    )?,
                };
                let name = obj.get("name").and_then(Value::as_str)?;
                let namespace = obj
                    .get("namespace")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.namespace);
                Some(ArtifactKey {
                    kind,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            })
            .collect()
    }

    /// Point every reference to `target` at `new_name` instead
    pub fn rewrite_reference(&mut self, target: &ArtifactKey, new_name: &str) {
        let slots = self.kind.reference_slots(&self.spec);
        let pointers: Vec<String> = slots
            .into_iter()
            .filter(|(pointer, fixed)| {
                self.spec.pointer(pointer).is_some_and(|obj| {
                    let kind = fixed.or_else(|| {
                        ArtifactKind::from_reference(
                            obj.get("group").and_then(Value::as_str).unwrap_or_default(),
                            obj.get("kind").and_then(Value::as_str).unwrap_or_default(),
                        )
                    });
                    let namespace = obj
                        .get("namespace")
                        .and_then(Value::as_str)
                        .unwrap_or(&self.namespace);
                    kind == Some(target.kind)
                        && namespace == target.namespace
                        && obj.get("name").and_then(Value::as_str) == Some(target.name.as_str())
                })
            })
            .map(|(pointer, _)| pointer)
            .collect();

        for pointer in pointers {
            if let Some(Value::Object(obj)) = self.spec.pointer_mut(&pointer) {
                obj.insert("name".to_string(), Value::String(new_name.to_string()));
            }
        }
    }

    /// Whether `existing` already provides everything this artifact asks for.
    ///
    /// Fields the API server adds (defaults, status) are ignored: only the
    /// fields set on the desired artifact are compared.
    pub fn satisfied_by(&self, existing: &Artifact) -> bool {
        self.kind == existing.kind
            && self.namespace == existing.namespace
            && json_subset(&self.spec, &existing.spec)
    }

    pub(crate) fn to_dynamic(&self) -> DynamicObject {
        let ar = self.kind.api_resource();
        let mut obj = DynamicObject::new(&self.name, &ar).within(&self.namespace);
        obj.metadata.labels = Some(self.labels.clone());
        if !self.annotations.is_empty() {
            obj.metadata.annotations = Some(self.annotations.clone());
        }
        obj.metadata.resource_version = self.resource_version.clone();
        obj.data = serde_json::json!({ "spec": self.spec });
        obj
    }

    pub(crate) fn from_dynamic(kind: ArtifactKind, obj: DynamicObject) -> Self {
        Self {
            kind,
            name: obj.metadata.name.unwrap_or_default(),
            namespace: obj.metadata.namespace.unwrap_or_default(),
            labels: obj.metadata.labels.unwrap_or_default(),
            annotations: obj.metadata.annotations.unwrap_or_default(),
            spec: obj.data.get("spec").cloned().unwrap_or(Value::Null),
            resource_version: obj.metadata.resource_version,
        }
    }
}

/// `desired` is contained in `existing`: every field set in `desired` has an
/// equal value in `existing`. Arrays must match element-wise.
fn json_subset(desired: &Value, existing: &Value) -> bool {
    match (desired, existing) {
        (Value::Object(d), Value::Object(e)) => d
            .iter()
            .all(|(k, v)| e.get(k).is_some_and(|ev| json_subset(v, ev))),
        (Value::Array(d), Value::Array(e)) => {
            d.len() == e.len() && d.iter().zip(e).all(|(a, b)| json_subset(a, b))
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => desired == existing,
    }
}
