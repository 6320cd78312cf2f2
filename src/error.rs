//! Error types for the intents operator
//!
//! Errors carry enough context (intents name, artifact kind, service) to be
//! useful in controller logs. The reconciler classifies them into the
//! handling categories it cares about: conflicts are requeued, missing pods
//! are reported as events, validation failures wait for a spec change and
//! everything else goes through the controller's backoff.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for intents reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed ClientIntents spec or unsupported call combination
    #[error("validation error for {intents}: {message}")]
    Validation {
        /// Name of the ClientIntents with the invalid spec
        intents: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.calls[0].httpResources")
        field: Option<String>,
    },

    /// No non-terminating pod implements the requested service
    #[error("no running pods for service {service} in namespace {namespace}")]
    PodNotFound {
        /// Logical service name that was resolved
        service: String,
        /// Namespace that was searched
        namespace: String,
    },

    /// Lost an optimistic concurrency race against another writer
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Artifact kind being written
        kind: String,
        /// Artifact name being written
        name: String,
        /// Server-provided detail
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Invalid operator configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "artifact-store", "resolver")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            intents: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with intents context and field path
    pub fn validation_for_field(
        intents: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            intents: intents.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a pod-not-found error for a service
    pub fn pod_not_found(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::PodNotFound {
            service: service.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a conflict error for an artifact write
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error is an optimistic concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube { source } => is_api_status(source, 409),
            _ => false,
        }
    }

    /// Whether this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source } if is_api_status(source, 404))
    }

    /// Whether this error is a missing client or target pod
    pub fn is_pod_not_found(&self) -> bool {
        matches!(self, Error::PodNotFound { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors need a spec or
    /// deployment fix. Kubernetes 4xx errors other than conflicts and
    /// throttling will not succeed on retry either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::PodNotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Config(_) => false,
            Error::Internal { .. } => true,
        }
    }
}

fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            kind: None,
        }
    }
}
