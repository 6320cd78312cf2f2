//! Strimzi KafkaUser types
//!
//! A KafkaUser is both the broker principal (its name) and the holder of
//! simple ACLs for that principal.

use serde::{Deserialize, Serialize};

use super::policy_resource;
use crate::artifact::ArtifactKind;
use crate::crd::KafkaOperation;
use crate::kube_utils::ObjectMeta;

/// Label that binds a KafkaUser to its Kafka cluster
pub const STRIMZI_CLUSTER_LABEL: &str = "strimzi.io/cluster";

/// Strimzi KafkaUser
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KafkaUser {
    /// API version
    #[serde(default = "KafkaUser::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "KafkaUser::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: KafkaUserSpec,
}

policy_resource!(KafkaUser, KafkaUserSpec, ArtifactKind::KafkaUser);

/// KafkaUser spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KafkaUserSpec {
    /// How the user authenticates
    pub authentication: KafkaUserAuthentication,
    /// ACLs granted to the user
    pub authorization: KafkaUserAuthorization,
}

/// KafkaUser authentication
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KafkaUserAuthentication {
    /// Authentication type (tls)
    #[serde(rename = "type")]
    pub type_: String,
}

impl KafkaUserAuthentication {
    /// Mutual TLS client certificates
    pub fn tls() -> Self {
        Self {
            type_: "tls".to_string(),
        }
    }
}

/// KafkaUser authorization
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KafkaUserAuthorization {
    /// Authorization type (simple)
    #[serde(rename = "type")]
    pub type_: String,
    /// ACL rules
    pub acls: Vec<AclRule>,
}

impl KafkaUserAuthorization {
    /// Kafka's built-in ACL authorizer
    pub fn simple(acls: Vec<AclRule>) -> Self {
        Self {
            type_: "simple".to_string(),
            acls,
        }
    }
}

/// One ACL entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AclRule {
    /// Resource the rule applies to
    pub resource: AclResource,
    /// Allowed operations
    pub operations: Vec<AclOperation>,
    /// Host the rule applies to
    pub host: String,
}

impl AclRule {
    /// Allow one operation on a topic from any host
    pub fn topic(name: impl Into<String>, operation: AclOperation) -> Self {
        Self {
            resource: AclResource {
                type_: "topic".to_string(),
                name: name.into(),
                pattern_type: "literal".to_string(),
            },
            operations: vec![operation],
            host: "*".to_string(),
        }
    }
}

/// ACL resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AclResource {
    /// Resource type (topic, group, cluster)
    #[serde(rename = "type")]
    pub type_: String,
    /// Resource name
    pub name: String,
    /// literal or prefix
    pub pattern_type: String,
}

/// Strimzi ACL operation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AclOperation {
    /// Every operation
    All,
    /// Read (consume)
    Read,
    /// Write (produce)
    Write,
    /// Create topics
    Create,
    /// Alter topics
    Alter,
    /// Delete topics
    Delete,
    /// Describe topics
    Describe,
    /// Cluster actions
    ClusterAction,
    /// Describe configs
    DescribeConfigs,
    /// Alter configs
    AlterConfigs,
    /// Idempotent produce
    IdempotentWrite,
}

impl From<KafkaOperation> for AclOperation {
    fn from(op: KafkaOperation) -> Self {
        match op {
            KafkaOperation::All => Self::All,
            KafkaOperation::Consume => Self::Read,
            KafkaOperation::Produce => Self::Write,
            KafkaOperation::Create => Self::Create,
            KafkaOperation::Alter => Self::Alter,
            KafkaOperation::Delete => Self::Delete,
            KafkaOperation::Describe => Self::Describe,
            KafkaOperation::ClusterAction => Self::ClusterAction,
            KafkaOperation::DescribeConfigs => Self::DescribeConfigs,
            KafkaOperation::AlterConfigs => Self::AlterConfigs,
            KafkaOperation::IdempotentWrite => Self::IdempotentWrite,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_operations_map_to_acl_operations() {
        assert_eq!(AclOperation::from(KafkaOperation::Consume), AclOperation::Read);
        assert_eq!(AclOperation::from(KafkaOperation::Produce), AclOperation::Write);
        assert_eq!(AclOperation::from(KafkaOperation::All), AclOperation::All);
    }

    #[test]
    fn topic_acl_serializes_strimzi_shape() {
        let user = KafkaUser::new(
            ObjectMeta::new("checkout-shop-1a2b3c4d-kafka", "streaming")
                .with_label(STRIMZI_CLUSTER_LABEL, "kafka"),
            KafkaUserSpec {
                authentication: KafkaUserAuthentication::tls(),
                authorization: KafkaUserAuthorization::simple(vec![AclRule::topic(
                    "orders",
                    AclOperation::Write,
                )]),
            },
        );
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["apiVersion"], "kafka.strimzi.io/v1beta2");
        assert_eq!(json["metadata"]["labels"]["strimzi.io/cluster"], "kafka");
        assert_eq!(json["spec"]["authentication"]["type"], "tls");
        let acl = &json["spec"]["authorization"]["acls"][0];
        assert_eq!(acl["resource"]["patternType"], "literal");
        assert_eq!(acl["operations"][0], "Write");
    }
}
