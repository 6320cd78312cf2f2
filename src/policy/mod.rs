//! Policy resource types produced by the backends
//!
//! Types for generating:
//! - Cilium CiliumNetworkPolicy (L4 network segmentation)
//! - Linkerd Server, HTTPRoute, MeshTLSAuthentication, AuthorizationPolicy
//!   (mTLS identity-based access control)
//! - Strimzi KafkaUser (broker ACLs)
//! - ACK IAM Policy and Role (cloud IAM)
//!
//! Every type implements [`PolicyResource`], which ties it to its
//! [`ArtifactKind`] and converts it into the untyped [`Artifact`] the engine
//! works with.

mod cilium;
mod iam;
mod kafka;
mod linkerd;

use serde::Serialize;

use crate::artifact::{Artifact, ArtifactKind};
use crate::kube_utils::{HasApiResource, ObjectMeta};
use crate::Error;

pub use cilium::{
    CiliumIngressRule, CiliumNetworkPolicy, CiliumNetworkPolicySpec, CiliumPort, CiliumPortRule,
    EndpointSelector,
};
pub use iam::{
    IamPolicy, IamPolicySpec, IamRole, IamRoleSpec, PolicyDocument, PolicyRef, PolicyRefSource,
    Statement,
};
pub use kafka::{
    AclOperation, AclResource, AclRule, KafkaUser, KafkaUserAuthentication,
    KafkaUserAuthorization, KafkaUserSpec, STRIMZI_CLUSTER_LABEL,
};
pub use linkerd::{
    AuthorizationPolicy, AuthorizationPolicySpec, HttpRoute, HttpRouteMatch, HttpRouteRule,
    HttpRouteSpec, LabelSelector, MeshTlsAuthentication, MeshTlsAuthenticationSpec, PathMatch,
    PolicyTargetRef, Server, ServerSpec,
};

/// A typed backend resource that the engine can own
pub trait PolicyResource: HasApiResource {
    /// Engine-side kind of this resource
    const ARTIFACT: ArtifactKind;
    /// Spec payload
    type Spec: Serialize;

    /// Split into metadata and spec
    fn into_parts(self) -> (ObjectMeta, Self::Spec);

    /// Convert into an untyped artifact
    fn into_artifact(self) -> Result<Artifact, Error>
    where
        Self: Sized,
    {
        let (metadata, spec) = self.into_parts();
        let spec = serde_json::to_value(spec)
            .map_err(|e| Error::serialization_for_kind(Self::KIND, e.to_string()))?;
        Ok(Artifact::new(Self::ARTIFACT, metadata, spec))
    }
}

/// Implement `HasApiResource`, serde defaults, `new` and `PolicyResource`
/// for a `{ api_version, kind, metadata, spec }` resource struct.
macro_rules! policy_resource {
    ($type:ident, $spec:ty, $artifact:expr) => {
        impl $crate::kube_utils::HasApiResource for $type {
            const API_VERSION: &'static str = $artifact.api_version();
            const KIND: &'static str = $artifact.kind_str();
        }

        impl $type {
            fn default_api_version() -> String {
                <Self as $crate::kube_utils::HasApiResource>::API_VERSION.to_string()
            }
            fn default_kind() -> String {
                <Self as $crate::kube_utils::HasApiResource>::KIND.to_string()
            }

            #[doc = concat!("Create a new ", stringify!($type))]
            pub fn new(metadata: $crate::kube_utils::ObjectMeta, spec: $spec) -> Self {
                Self {
                    api_version: Self::default_api_version(),
                    kind: Self::default_kind(),
                    metadata,
                    spec,
                }
            }
        }

        impl $crate::policy::PolicyResource for $type {
            const ARTIFACT: $crate::artifact::ArtifactKind = $artifact;
            type Spec = $spec;

            fn into_parts(self) -> ($crate::kube_utils::ObjectMeta, $spec) {
                (self.metadata, self.spec)
            }
        }
    };
}

pub(crate) use policy_resource;
