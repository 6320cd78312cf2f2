//! Integration tests for the intents operator
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how service owners declare intents and what the operator enforces.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading and updating
//!   ClientIntents through the Kubernetes API
//!
//! - `enforcement`: Stories about the reconcile loop writing and releasing
//!   policy artifacts against a live API server
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod crd_operations;
mod enforcement;
mod helpers;
