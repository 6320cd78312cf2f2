//! Message broker backend (Strimzi)
//!
//! Kafka calls name a Kafka cluster and the topics the client uses on it.
//! Each (client, cluster) pair becomes one `KafkaUser` next to the cluster:
//! the user is the client's broker principal and carries its ACLs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use super::{converge_backend, release_backend, Backend, BackendReport, Owner, PolicyManager, ReconcilePass};
use crate::artifact::{Artifact, SyncReport};
use crate::crd::{CallType, ClientIntents};
use crate::kube_utils::{bounded_name, ObjectMeta, MAX_LABEL_VALUE_LEN};
use crate::policy::{
    AclOperation, AclRule, KafkaUser, KafkaUserAuthentication, KafkaUserAuthorization,
    KafkaUserSpec, PolicyResource, STRIMZI_CLUSTER_LABEL,
};
use crate::resolver::{ResolvedCall, Workload};
use crate::Error;

/// Compiles kafka calls into KafkaUsers
#[derive(Debug, Default)]
pub struct BrokerManager;

impl BrokerManager {
    /// Create a new manager
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PolicyManager for BrokerManager {
    fn backend(&self) -> Backend {
        Backend::Broker
    }

    fn compute_desired(
        &self,
        intents: &ClientIntents,
        _client: &Workload,
        _targets: &[ResolvedCall],
    ) -> Result<Vec<Artifact>, Error> {
        let client_identity = intents.client_identity();
        let namespace = intents.namespace_or_default();

        // (namespace, cluster) -> (topic, operation)
        let mut clusters: BTreeMap<(String, String), BTreeSet<(String, AclOperation)>> =
            BTreeMap::new();
        for call in intents.calls_of(&[CallType::Kafka]) {
            let acls = clusters
                .entry((call.target_namespace(&namespace).to_string(), call.name.clone()))
                .or_default();
            for topic in &call.kafka_topics {
                for operation in &topic.operations {
                    acls.insert((topic.name.clone(), AclOperation::from(*operation)));
                }
            }
        }

        clusters
            .into_iter()
            .map(|((namespace, cluster), acls)| {
                let name = bounded_name(&format!("{client_identity}-{cluster}"), MAX_LABEL_VALUE_LEN);
                KafkaUser::new(
                    ObjectMeta::new(name, namespace).with_label(STRIMZI_CLUSTER_LABEL, &cluster),
                    KafkaUserSpec {
                        authentication: KafkaUserAuthentication::tls(),
                        authorization: KafkaUserAuthorization::simple(
                            acls.into_iter()
                                .map(|(topic, operation)| AclRule::topic(topic, operation))
                                .collect(),
                        ),
                    },
                )
                .into_artifact()
            })
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
