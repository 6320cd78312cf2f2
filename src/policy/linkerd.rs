//! Linkerd policy types
//!
//! Types for generating Linkerd authorization resources:
//! - Server: a port on a set of pods, the anchor everything else targets
//! - HTTPRoute: a path/method subset of a Server's traffic
//! - MeshTLSAuthentication: the mTLS identities a client presents
//! - AuthorizationPolicy: binds a target (Server or route) to authentications

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::policy_resource;
use crate::artifact::ArtifactKind;
use crate::kube_utils::ObjectMeta;

/// Linkerd policy API group
pub const POLICY_GROUP: &str = "policy.linkerd.io";

/// Linkerd Server: a port on the pods matching a selector
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// API version
    #[serde(default = "Server::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "Server::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: ServerSpec,
}

policy_resource!(Server, ServerSpec, ArtifactKind::Server);

/// Server spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Pods the Server applies to
    pub pod_selector: LabelSelector,
    /// Container port
    pub port: u16,
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector on a single label
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_labels: BTreeMap::from([(key.into(), value.into())]),
        }
    }
}

/// Reference from one Linkerd policy resource to another
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyTargetRef {
    /// API group
    #[serde(default)]
    pub group: String,
    /// Resource kind
    pub kind: String,
    /// Resource name (same namespace)
    pub name: String,
}

impl PolicyTargetRef {
    /// Reference to a Linkerd policy resource
    pub fn to(kind: ArtifactKind, name: impl Into<String>) -> Self {
        Self {
            group: POLICY_GROUP.to_string(),
            kind: kind.kind_str().to_string(),
            name: name.into(),
        }
    }
}

// =============================================================================
// HTTPRoute
// =============================================================================

/// Linkerd HTTPRoute attached to a Server
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// API version
    #[serde(default = "HttpRoute::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "HttpRoute::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: HttpRouteSpec,
}

policy_resource!(HttpRoute, HttpRouteSpec, ArtifactKind::HttpRoute);

/// HTTPRoute spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    /// Servers this route attaches to
    pub parent_refs: Vec<PolicyTargetRef>,
    /// Matching rules
    pub rules: Vec<HttpRouteRule>,
}

/// HTTPRoute rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpRouteRule {
    /// Request matches (any)
    pub matches: Vec<HttpRouteMatch>,
}

/// HTTPRoute request match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpRouteMatch {
    /// Path match
    pub path: PathMatch,
    /// HTTP method; absent matches every method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Path match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathMatch {
    /// Match type (PathPrefix, Exact)
    #[serde(rename = "type")]
    pub type_: String,
    /// Path value
    pub value: String,
}

impl PathMatch {
    /// Prefix match on a path
    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            type_: "PathPrefix".to_string(),
            value: value.into(),
        }
    }
}

// =============================================================================
// MeshTLSAuthentication
// =============================================================================

/// Linkerd MeshTLSAuthentication: a set of accepted mTLS identities
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshTlsAuthentication {
    /// API version
    #[serde(default = "MeshTlsAuthentication::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "MeshTlsAuthentication::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: MeshTlsAuthenticationSpec,
}

policy_resource!(
    MeshTlsAuthentication,
    MeshTlsAuthenticationSpec,
    ArtifactKind::MeshTlsAuthentication
);

/// MeshTLSAuthentication spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MeshTlsAuthenticationSpec {
    /// Proxy identities (`<sa>.<ns>.serviceaccount.identity.linkerd.<trust-domain>`)
    pub identities: Vec<String>,
}

// =============================================================================
// AuthorizationPolicy
// =============================================================================

/// Linkerd AuthorizationPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicy {
    /// API version
    #[serde(default = "AuthorizationPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "AuthorizationPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: AuthorizationPolicySpec,
}

policy_resource!(
    AuthorizationPolicy,
    AuthorizationPolicySpec,
    ArtifactKind::AuthorizationPolicy
);

/// AuthorizationPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicySpec {
    /// Server or HTTPRoute being authorized
    pub target_ref: PolicyTargetRef,
    /// Authentications a request must satisfy
    pub required_authentication_refs: Vec<PolicyTargetRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyResource;

    #[test]
    fn route_references_parent_server() {
        let route = HttpRoute::new(
            ObjectMeta::new("route-for-payments-port-8080-abc123", "billing"),
            HttpRouteSpec {
                parent_refs: vec![PolicyTargetRef::to(
                    ArtifactKind::Server,
                    "server-for-payments-port-8080",
                )],
                rules: vec![HttpRouteRule {
                    matches: vec![HttpRouteMatch {
                        path: PathMatch::prefix("/charge"),
                        method: Some("POST".to_string()),
                    }],
                }],
            },
        );
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["apiVersion"], "policy.linkerd.io/v1beta3");
        assert_eq!(json["spec"]["rules"][0]["matches"][0]["path"]["type"], "PathPrefix");

        let artifact = route.into_artifact().unwrap();
        let refs = artifact.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, ArtifactKind::Server);
        assert_eq!(refs[0].name, "server-for-payments-port-8080");
    }

    #[test]
    fn authorization_policy_round_trips_references() {
        let policy = AuthorizationPolicy::new(
            ObjectMeta::new("authz", "billing"),
            AuthorizationPolicySpec {
                target_ref: PolicyTargetRef::to(ArtifactKind::HttpRoute, "route"),
                required_authentication_refs: vec![PolicyTargetRef::to(
                    ArtifactKind::MeshTlsAuthentication,
                    "meshtls-for-client-checkout",
                )],
            },
        );
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["apiVersion"], "policy.linkerd.io/v1alpha1");
        assert_eq!(json["spec"]["targetRef"]["kind"], "HTTPRoute");
        assert_eq!(
            json["spec"]["requiredAuthenticationRefs"][0]["kind"],
            "MeshTLSAuthentication"
        );

        let refs = policy.into_artifact().unwrap().references();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn method_is_optional() {
        let m = HttpRouteMatch {
            path: PathMatch::prefix("/"),
            method: None,
        };
        let json = serde_json::to_value(m).unwrap();
        assert!(json.get("method").is_none());
    }
}
