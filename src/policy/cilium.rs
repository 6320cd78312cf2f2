//! Cilium CiliumNetworkPolicy types
//!
//! Types for generating CiliumNetworkPolicy resources for L4 eBPF-based
//! segmentation: one ingress allow rule per (client, target) pair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::policy_resource;
use crate::artifact::ArtifactKind;
use crate::kube_utils::ObjectMeta;

/// Cilium Network Policy for L4 eBPF-based network enforcement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicy {
    /// API version
    #[serde(default = "CiliumNetworkPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "CiliumNetworkPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: CiliumNetworkPolicySpec,
}

policy_resource!(
    CiliumNetworkPolicy,
    CiliumNetworkPolicySpec,
    ArtifactKind::CiliumNetworkPolicy
);

/// CiliumNetworkPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicySpec {
    /// Endpoint selector (which pods this applies to)
    pub endpoint_selector: EndpointSelector,
    /// Ingress rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<CiliumIngressRule>,
}

/// Endpoint selector for CiliumNetworkPolicy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSelector {
    /// Match labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl EndpointSelector {
    /// Selector over a fixed set of labels
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Cilium ingress rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumIngressRule {
    /// From endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_endpoints: Vec<EndpointSelector>,
    /// To ports; empty allows every port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<CiliumPortRule>,
}

/// Cilium port rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CiliumPortRule {
    /// Ports
    pub ports: Vec<CiliumPort>,
}

/// Cilium port specification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CiliumPort {
    /// Port number
    pub port: String,
    /// Protocol (TCP, UDP, SCTP)
    pub protocol: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyResource;

    #[test]
    fn serializes_cilium_field_names() {
        let policy = CiliumNetworkPolicy::new(
            ObjectMeta::new("lattice-intents-payments-from-checkout", "billing"),
            CiliumNetworkPolicySpec {
                endpoint_selector: EndpointSelector::from_labels([(
                    "lattice.dev/server-identity",
                    "payments",
                )]),
                ingress: vec![CiliumIngressRule {
                    from_endpoints: vec![EndpointSelector::from_labels([
                        ("lattice.dev/server-identity", "checkout"),
                        ("k8s:io.kubernetes.pod.namespace", "shop"),
                    ])],
                    to_ports: vec![CiliumPortRule {
                        ports: vec![CiliumPort {
                            port: "8080".to_string(),
                            protocol: "TCP".to_string(),
                        }],
                    }],
                }],
            },
        );

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["apiVersion"], "cilium.io/v2");
        assert_eq!(json["kind"], "CiliumNetworkPolicy");
        assert_eq!(
            json["spec"]["endpointSelector"]["matchLabels"]["lattice.dev/server-identity"],
            "payments"
        );
        assert_eq!(json["spec"]["ingress"][0]["toPorts"][0]["ports"][0]["port"], "8080");

        let artifact = policy.into_artifact().unwrap();
        assert_eq!(artifact.kind, ArtifactKind::CiliumNetworkPolicy);
        assert!(artifact.spec.get("endpointSelector").is_some());
    }

    #[test]
    fn empty_ports_are_omitted() {
        let rule = CiliumIngressRule {
            from_endpoints: vec![],
            to_ports: vec![],
        };
        assert_eq!(serde_json::to_value(rule).unwrap(), serde_json::json!({}));
    }
}
