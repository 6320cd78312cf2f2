//! ClientIntents CRD: one object per calling workload per namespace, listing
//! the services it calls and how.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus};
use crate::identity::format_identity;
use crate::Error;

// =============================================================================
// CRD
// =============================================================================

/// Spec for ClientIntents: the calls a service is allowed to make
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "ClientIntents",
    plural = "clientintents",
    shortname = "ci",
    namespaced,
    status = "ClientIntentsStatus",
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.service.name"}"#,
    printcolumn = r#"{"name":"UpToDate","type":"boolean","jsonPath":".status.upToDate"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClientIntentsSpec {
    /// The calling service
    pub service: ServiceRef,

    /// Services this client calls, in declaration order
    #[serde(default)]
    pub calls: Vec<Call>,
}

/// Reference to the calling service
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceRef {
    /// Logical service name
    pub name: String,
}

/// Kind of call, selecting which backends enforce it
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Plain connectivity, mesh layer only (no L7 routing)
    #[default]
    Generic,
    /// HTTP with optional path/method restrictions
    Http,
    /// Kafka topic access
    Kafka,
    /// Database access (no in-cluster enforcement backend)
    Database,
    /// Cloud IAM access; the call name is the resource ARN
    Aws,
}

impl CallType {
    /// Lowercase name as it appears in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Http => "http",
            Self::Kafka => "kafka",
            Self::Database => "database",
            Self::Aws => "aws",
        }
    }

    /// Whether the call targets a workload running in the cluster
    pub fn targets_workload(&self) -> bool {
        matches!(self, Self::Generic | Self::Http | Self::Kafka)
    }
}

/// A single call from the client to a target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Target name (service, Kafka cluster, or AWS resource ARN)
    pub name: String,

    /// Target namespace (defaults to the ClientIntents namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Call type (defaults to generic)
    #[serde(default, rename = "type")]
    pub call_type: CallType,

    /// HTTP paths and methods (http calls only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_resources: Vec<HttpResource>,

    /// Kafka topics and operations (kafka calls only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kafka_topics: Vec<KafkaTopic>,

    /// IAM actions on the resource ARN (aws calls only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aws_actions: Vec<String>,
}

impl Call {
    /// Resolve target namespace using a default
    pub fn target_namespace<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_namespace)
    }

    /// Identity of the target service
    pub fn target_identity(&self, default_namespace: &str) -> String {
        format_identity(&self.name, self.target_namespace(default_namespace))
    }
}

/// An HTTP path the client may call
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HttpResource {
    /// Path prefix, must start with '/'
    pub path: String,

    /// Allowed methods (empty = any method)
    #[serde(default)]
    pub methods: Vec<HttpMethod>,
}

/// HTTP request method
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl HttpMethod {
    /// Method name as sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
        }
    }
}

/// Kafka topic and the operations allowed on it
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KafkaTopic {
    /// Topic name
    pub name: String,

    /// Allowed operations
    #[serde(default)]
    pub operations: Vec<KafkaOperation>,
}

/// Kafka ACL operation
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum KafkaOperation {
    All,
    Consume,
    Produce,
    Create,
    Alter,
    Delete,
    Describe,
    ClusterAction,
    DescribeConfigs,
    AlterConfigs,
    IdempotentWrite,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a ClientIntents
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientIntentsStatus {
    /// Generation of the spec last reconciled successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Whether every enabled backend applied the current spec
    #[serde(default)]
    pub up_to_date: bool,

    /// Last-applied state per backend
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backends: BTreeMap<String, BackendStatus>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Last-applied state of one backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    /// Artifacts this backend maintains for the intents
    #[serde(default)]
    pub applied_artifacts: u32,

    /// Client pod lacks the mesh sidecar, mesh policies were not created
    #[serde(default)]
    pub missing_sidecar: bool,

    /// Why the backend was skipped, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl ClientIntentsStatus {
    /// Compare two statuses ignoring condition timestamps
    pub fn same_state(&self, other: &ClientIntentsStatus) -> bool {
        self.observed_generation == other.observed_generation
            && self.up_to_date == other.up_to_date
            && self.backends == other.backends
            && self.conditions.len() == other.conditions.len()
            && self
                .conditions
                .iter()
                .zip(&other.conditions)
                .all(|(a, b)| a.same_state(b))
    }

    /// Status after a successful pass
    pub fn ready(generation: Option<i64>, backends: BTreeMap<String, BackendStatus>) -> Self {
        Self {
            observed_generation: generation,
            up_to_date: true,
            backends,
            conditions: vec![Condition::new(
                "Ready",
                ConditionStatus::True,
                "PoliciesApplied",
                "Policies applied for all enabled backends",
            )],
        }
    }

    /// Status after a validation failure
    pub fn invalid(generation: Option<i64>, message: &str) -> Self {
        Self {
            observed_generation: generation,
            up_to_date: false,
            backends: BTreeMap::new(),
            conditions: vec![Condition::new(
                "Ready",
                ConditionStatus::False,
                "ValidationFailed",
                message,
            )],
        }
    }
}

// =============================================================================
// Helpers and validation
// =============================================================================

impl ClientIntents {
    /// Logical name of the calling service
    pub fn service_name(&self) -> &str {
        &self.spec.service.name
    }

    /// Namespace of the object (empty if unset)
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// Identity of the calling service, used as the ownership label value
    pub fn client_identity(&self) -> String {
        format_identity(self.service_name(), &self.namespace_or_default())
    }

    /// Calls of the given types, in declaration order
    pub fn calls_of<'a>(&'a self, types: &'a [CallType]) -> impl Iterator<Item = &'a Call> + 'a {
        self.spec
            .calls
            .iter()
            .filter(move |c| types.contains(&c.call_type))
    }
}

impl ClientIntentsSpec {
    /// Validate the spec.
    ///
    /// Admission covers the common mistakes; this catches what reaches the
    /// reconciler anyway so a bad call is never silently dropped.
    pub fn validate(&self, intents_name: &str) -> Result<(), Error> {
        if self.service.name.trim().is_empty() {
            return Err(Error::validation_for_field(
                intents_name,
                "spec.service.name",
                "service name cannot be empty",
            ));
        }

        for (i, call) in self.calls.iter().enumerate() {
            let field = |suffix: &str| format!("spec.calls[{i}]{suffix}");

            if call.name.trim().is_empty() {
                return Err(Error::validation_for_field(
                    intents_name,
                    field(".name"),
                    "call target name cannot be empty",
                ));
            }
            if !call.http_resources.is_empty() && call.call_type != CallType::Http {
                return Err(Error::validation_for_field(
                    intents_name,
                    field(".httpResources"),
                    format!(
                        "httpResources is only valid on http calls, not {}",
                        call.call_type.as_str()
                    ),
                ));
            }
            if !call.kafka_topics.is_empty() && call.call_type != CallType::Kafka {
                return Err(Error::validation_for_field(
                    intents_name,
                    field(".kafkaTopics"),
                    format!(
                        "kafkaTopics is only valid on kafka calls, not {}",
                        call.call_type.as_str()
                    ),
                ));
            }
            if !call.aws_actions.is_empty() && call.call_type != CallType::Aws {
                return Err(Error::validation_for_field(
                    intents_name,
                    field(".awsActions"),
                    format!(
                        "awsActions is only valid on aws calls, not {}",
                        call.call_type.as_str()
                    ),
                ));
            }

            match call.call_type {
                CallType::Http => {
                    for res in &call.http_resources {
                        if !res.path.starts_with('/') {
                            return Err(Error::validation_for_field(
                                intents_name,
                                field(".httpResources"),
                                format!("path '{}' must start with '/'", res.path),
                            ));
                        }
                    }
                }
                CallType::Kafka => {
                    if call.kafka_topics.is_empty() {
                        return Err(Error::validation_for_field(
                            intents_name,
                            field(".kafkaTopics"),
                            "kafka calls must declare at least one topic",
                        ));
                    }
                    for topic in &call.kafka_topics {
                        if topic.name.is_empty() || topic.operations.is_empty() {
                            return Err(Error::validation_for_field(
                                intents_name,
                                field(".kafkaTopics"),
                                "kafka topics need a name and at least one operation",
                            ));
                        }
                    }
                }
                CallType::Aws => {
                    if !call.name.starts_with("arn:") {
                        return Err(Error::validation_for_field(
                            intents_name,
                            field(".name"),
                            format!("aws call target '{}' is not an ARN", call.name),
                        ));
                    }
                    if call.aws_actions.is_empty() {
                        return Err(Error::validation_for_field(
                            intents_name,
                            field(".awsActions"),
                            "aws calls must declare at least one action",
                        ));
                    }
                }
                CallType::Generic | CallType::Database => {}
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
