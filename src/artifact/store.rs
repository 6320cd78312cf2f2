//! Artifact persistence
//!
//! All backends write through the same trait so the engine's ordering,
//! sharing and cleanup rules are implemented once. The production store
//! talks to the API server with dynamic objects; writes carry the observed
//! resourceVersion so concurrent writers surface as conflicts.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::core::DynamicObject;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use super::{Artifact, ArtifactKind};
use crate::Error;
use crate::{FIELD_MANAGER, OWNER_IDENTITY_LABEL};

/// Read and write access to owned artifacts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// List artifacts of `kind` labeled as owned by `owner`, in any namespace
    async fn list_owned(&self, kind: ArtifactKind, owner: &str) -> Result<Vec<Artifact>, Error>;

    /// List every artifact of `kind` in a namespace, owned or not
    async fn list_in_namespace(
        &self,
        kind: ArtifactKind,
        namespace: &str,
    ) -> Result<Vec<Artifact>, Error>;

    /// Create a new artifact; fails with a conflict if the name is taken
    async fn create(&self, artifact: &Artifact) -> Result<(), Error>;

    /// Replace an artifact at the resourceVersion it was read at
    async fn replace(&self, artifact: &Artifact) -> Result<(), Error>;

    /// Delete an artifact; already-gone artifacts are not an error
    async fn delete(&self, artifact: &Artifact) -> Result<(), Error>;
}

/// Store backed by the Kubernetes API server
pub struct KubeArtifactStore {
    client: Client,
}

impl KubeArtifactStore {
    /// Create a new store
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ArtifactKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn list(
        &self,
        kind: ArtifactKind,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<Artifact>, Error> {
        match self.api(kind, namespace).list(params).await {
            Ok(list) => Ok(list
                .items
                .into_iter()
                .map(|obj| Artifact::from_dynamic(kind, obj))
                .collect()),
            // CRD not installed: nothing of this kind can exist
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(kind = %kind, "artifact kind not served, treating as empty");
                Ok(vec![])
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PostParams::default()
    }
}

/// Turn a 409 from a write into a typed conflict
fn write_error(artifact: &Artifact, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(artifact.kind.kind_str(), &artifact.name, ae.message)
        }
        other => other.into(),
    }
}

#[async_trait]
impl ArtifactStore for KubeArtifactStore {
    async fn list_owned(&self, kind: ArtifactKind, owner: &str) -> Result<Vec<Artifact>, Error> {
        let params = ListParams::default().labels(&format!("{OWNER_IDENTITY_LABEL}={owner}"));
        self.list(kind, None, &params).await
    }

    async fn list_in_namespace(
        &self,
        kind: ArtifactKind,
        namespace: &str,
    ) -> Result<Vec<Artifact>, Error> {
        self.list(kind, Some(namespace), &ListParams::default())
            .await
    }

    async fn create(&self, artifact: &Artifact) -> Result<(), Error> {
        let api = self.api(artifact.kind, Some(&artifact.namespace));
        let mut obj = artifact.to_dynamic();
        obj.metadata.resource_version = None;
        api.create(&post_params(), &obj)
            .await
            .map_err(|e| write_error(artifact, e))?;
        Ok(())
    }

    async fn replace(&self, artifact: &Artifact) -> Result<(), Error> {
        let api = self.api(artifact.kind, Some(&artifact.namespace));
        api.replace(&artifact.name, &post_params(), &artifact.to_dynamic())
            .await
            .map_err(|e| write_error(artifact, e))?;
        Ok(())
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), Error> {
        let api = self.api(artifact.kind, Some(&artifact.namespace));
        let params = DeleteParams {
            preconditions: artifact.resource_version.as_ref().map(|rv| Preconditions {
                resource_version: Some(rv.clone()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        match api.delete(&artifact.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(write_error(artifact, e)),
        }
    }
}
