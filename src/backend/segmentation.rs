//! Network segmentation backend (Cilium)
//!
//! One CiliumNetworkPolicy per (client, target) pair, living next to the
//! target: it selects the target's pods and admits the client's pods on the
//! target's container ports.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{converge_backend, release_backend, Backend, BackendReport, Owner, PolicyManager, ReconcilePass};
use crate::artifact::{Artifact, SyncReport};
use crate::crd::ClientIntents;
use crate::kube_utils::{bounded_name, ObjectMeta, MAX_NAME_LEN};
use crate::policy::{
    CiliumIngressRule, CiliumNetworkPolicy, CiliumNetworkPolicySpec, CiliumPort, CiliumPortRule,
    EndpointSelector, PolicyResource,
};
use crate::resolver::{ResolvedCall, Workload};
use crate::{Error, SERVER_IDENTITY_LABEL};

/// Cilium's label for the namespace of an endpoint
const POD_NAMESPACE_LABEL: &str = "k8s:io.kubernetes.pod.namespace";

/// Compiles intents into CiliumNetworkPolicies
#[derive(Debug, Default)]
pub struct SegmentationManager;

impl SegmentationManager {
    /// Create a new manager
    pub fn new() -> Self {
        Self
    }

    fn policy_for(client_identity: &str, client: &Workload, target: &Workload) -> CiliumNetworkPolicy {
        let name = bounded_name(
            &format!(
                "lattice-intents-{}-from-{}",
                target.server_identity, client_identity
            ),
            MAX_NAME_LEN,
        );

        let ports: Vec<CiliumPort> = target
            .ports
            .iter()
            .map(|p| CiliumPort {
                port: p.port.to_string(),
                protocol: p.protocol.clone(),
            })
            .collect();
        let to_ports = if ports.is_empty() {
            vec![]
        } else {
            vec![CiliumPortRule { ports }]
        };

        CiliumNetworkPolicy::new(
            ObjectMeta::new(name, &target.namespace),
            CiliumNetworkPolicySpec {
                endpoint_selector: EndpointSelector::from_labels([(
                    SERVER_IDENTITY_LABEL,
                    target.server_identity.as_str(),
                )]),
                ingress: vec![CiliumIngressRule {
                    from_endpoints: vec![EndpointSelector::from_labels([
                        (SERVER_IDENTITY_LABEL, client.server_identity.as_str()),
                        (POD_NAMESPACE_LABEL, client.namespace.as_str()),
                    ])],
                    to_ports,
                }],
            },
        )
    }
}

#[async_trait]
impl PolicyManager for SegmentationManager {
    fn backend(&self) -> Backend {
        Backend::Segmentation
    }

    fn compute_desired(
        &self,
        intents: &ClientIntents,
        client: &Workload,
        targets: &[ResolvedCall],
    ) -> Result<Vec<Artifact>, Error> {
        let client_identity = intents.client_identity();
        // Several calls (http + kafka, say) to one target share a policy
        let mut by_target: BTreeMap<(String, String), &Workload> = BTreeMap::new();
        for target in targets {
            by_target
                .entry((
                    target.workload.namespace.clone(),
                    target.workload.server_identity.clone(),
                ))
                .or_insert(&target.workload);
        }

        by_target
            .into_values()
            .map(|target| Self::policy_for(&client_identity, client, target).into_artifact())
            .collect()
    }

    async fn reconcile(
        &self,
        pass: &ReconcilePass,
        intents: &ClientIntents,
        client: &Workload,
    ) -> Result<BackendReport, Error> {
        converge_backend(self, pass, intents, client).await
    }

    async fn delete_all(&self, pass: &ReconcilePass, owner: &Owner) -> Result<SyncReport, Error> {
        release_backend(self.backend(), pass, owner).await
    }
}
