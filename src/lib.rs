//! Lattice intents - turns declared service-to-service intents into
//! enforcement policy
//!
//! A `ClientIntents` object lists the services a client calls and how. The
//! operator compiles it into the native resources of each enabled
//! enforcement technology and keeps them converged as intents, pods and
//! installed technologies change.
//!
//! # Architecture
//!
//! - One reconcile per ClientIntents key, driven by `kube::runtime::Controller`
//! - Backends (network segmentation, service mesh, message broker, cloud
//!   IAM) form a closed set and only compute desired state
//! - A shared artifact engine writes desired state, shares equivalent
//!   artifacts between clients and releases what is no longer wanted
//! - Ownership is a label on each artifact; nothing else is persisted
//!
//! # Modules
//!
//! - [`crd`] - The ClientIntents custom resource
//! - [`controller`] - Reconciliation and controller wiring
//! - [`backend`] - Policy backends and the per-pass state they share
//! - [`artifact`] - Artifact model, store and convergence engine
//! - [`policy`] - Typed resources of the enforcement technologies
//! - [`resolver`] - Service name to workload resolution
//! - [`prerequisites`] - Detection of installed technologies
//! - [`identity`] - Canonical workload identities
//! - [`config`] - Operator configuration
//! - [`events`] - Kubernetes Event publishing
//! - [`telemetry`] - Logging and tracing setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod artifact;
pub mod backend;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod identity;
pub mod kube_utils;
pub mod policy;
pub mod prerequisites;
pub mod resolver;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels, annotations and names
// =============================================================================

/// Field manager and event reporter name
pub const FIELD_MANAGER: &str = "lattice-intents";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on every artifact
pub const LABEL_MANAGED_BY_VALUE: &str = "lattice-intents";

/// Label holding the identity of the ClientIntents that owns an artifact
pub const OWNER_IDENTITY_LABEL: &str = "lattice.dev/owner-identity";

/// Label declaring which service a pod implements
pub const SERVER_IDENTITY_LABEL: &str = "lattice.dev/server-identity";

/// Annotation Linkerd uses to mark pods for proxy injection
pub const LINKERD_INJECT_ANNOTATION: &str = "linkerd.io/inject";

/// Finalizer guarding artifact cleanup on ClientIntents deletion
pub const INTENTS_FINALIZER: &str = "lattice.dev/intents-cleanup";
