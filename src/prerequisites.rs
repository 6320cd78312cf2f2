//! Detection of the third-party controllers each backend writes for
//!
//! A backend only produces artifacts when the controller that consumes them
//! is installed, detected by the presence of a marker CRD. Answers are
//! cached in a [`PrerequisiteCache`] that lives for one reconcile pass, so a
//! CRD installed mid-flight is picked up by the next pass without restarts.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::Error;

/// Third-party technologies a backend depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technology {
    /// Cilium network policies
    Cilium,
    /// Linkerd service mesh policy
    Linkerd,
    /// Strimzi Kafka user operator
    Strimzi,
    /// AWS Controllers for Kubernetes, IAM
    AckIam,
}

impl Technology {
    /// Name of the CRD whose presence marks the technology as installed
    pub fn marker_crd(&self) -> &'static str {
        match self {
            Self::Cilium => "ciliumnetworkpolicies.cilium.io",
            Self::Linkerd => "servers.policy.linkerd.io",
            Self::Strimzi => "kafkausers.kafka.strimzi.io",
            Self::AckIam => "policies.iam.services.k8s.aws",
        }
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cilium => "cilium",
            Self::Linkerd => "linkerd",
            Self::Strimzi => "strimzi",
            Self::AckIam => "ack-iam",
        };
        f.write_str(name)
    }
}

/// Looks up CRDs by name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdProbe: Send + Sync {
    /// Whether a CRD with this name exists
    async fn crd_exists(&self, name: &str) -> Result<bool, Error>;
}

/// Probe backed by the apiextensions API
pub struct KubeCrdProbe {
    client: Client,
}

impl KubeCrdProbe {
    /// Create a new probe
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CrdProbe for KubeCrdProbe {
    async fn crd_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }
}

/// Per-pass cache of prerequisite answers
pub struct PrerequisiteCache {
    probe: Arc<dyn CrdProbe>,
    answers: DashMap<Technology, bool>,
}

impl PrerequisiteCache {
    /// Fresh cache over a probe
    pub fn new(probe: Arc<dyn CrdProbe>) -> Self {
        Self {
            probe,
            answers: DashMap::new(),
        }
    }

    /// Whether `technology` is installed, probing at most once per cache
    pub async fn is_installed(&self, technology: Technology) -> Result<bool, Error> {
        if let Some(answer) = self.answers.get(&technology) {
            return Ok(*answer);
        }
        let installed = self.probe.crd_exists(technology.marker_crd()).await?;
        debug!(technology = %technology, installed, "probed prerequisite");
        self.answers.insert(technology, installed);
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_are_cached_within_a_pass() {
        let mut probe = MockCrdProbe::new();
        probe
            .expect_crd_exists()
            .withf(|name| name.ends_with(".policy.linkerd.io"))
            .times(1)
            .returning(|_| Ok(true));

        let cache = PrerequisiteCache::new(Arc::new(probe));
        assert!(cache.is_installed(Technology::Linkerd).await.unwrap());
        assert!(cache.is_installed(Technology::Linkerd).await.unwrap());
    }

    #[tokio::test]
    async fn new_pass_probes_again() {
        let mut probe = MockCrdProbe::new();
        let mut calls = 0;
        probe.expect_crd_exists().times(2).returning(move |_| {
            calls += 1;
            Ok(calls > 1)
        });
        let probe: Arc<dyn CrdProbe> = Arc::new(probe);

        let first = PrerequisiteCache::new(probe.clone());
        assert!(!first.is_installed(Technology::Strimzi).await.unwrap());
        let second = PrerequisiteCache::new(probe);
        assert!(second.is_installed(Technology::Strimzi).await.unwrap());
    }

    #[tokio::test]
    async fn probe_errors_are_not_cached() {
        let mut probe = MockCrdProbe::new();
        probe
            .expect_crd_exists()
            .times(1)
            .returning(|_| Err(Error::internal_with_context("probe", "timeout")));
        let cache = PrerequisiteCache::new(Arc::new(probe));
        assert!(cache.is_installed(Technology::Cilium).await.is_err());
        assert!(cache.answers.is_empty());
    }
}
