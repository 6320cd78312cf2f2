//! In-memory artifact store for tests
//!
//! Behaves like the API server for the operations the engine uses: names
//! are unique per (kind, namespace), every write bumps the resourceVersion
//! and stale versions are rejected with a conflict.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Artifact, ArtifactKey, ArtifactKind, ArtifactStore};
use crate::Error;

#[derive(Default)]
pub(crate) struct MemoryStore {
    objects: Mutex<BTreeMap<ArtifactKey, Artifact>>,
    version: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of create/replace/delete calls that changed state
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_writes(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }

    pub(crate) fn all(&self) -> Vec<Artifact> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn of_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        self.lock()
            .values()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }

    pub(crate) fn get(&self, kind: ArtifactKind, namespace: &str, name: &str) -> Option<Artifact> {
        self.lock()
            .get(&ArtifactKey {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .cloned()
    }

    /// Seed an object as if another writer created it
    pub(crate) fn insert(&self, mut artifact: Artifact) {
        artifact.resource_version = Some(self.next_version());
        self.lock().insert(artifact.key(), artifact);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ArtifactKey, Artifact>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn list_owned(&self, kind: ArtifactKind, owner: &str) -> Result<Vec<Artifact>, Error> {
        Ok(self
            .lock()
            .values()
            .filter(|a| a.kind == kind && a.owner() == Some(owner))
            .cloned()
            .collect())
    }

    async fn list_in_namespace(
        &self,
        kind: ArtifactKind,
        namespace: &str,
    ) -> Result<Vec<Artifact>, Error> {
        Ok(self
            .lock()
            .values()
            .filter(|a| a.kind == kind && a.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create(&self, artifact: &Artifact) -> Result<(), Error> {
        let version = self.next_version();
        let mut objects = self.lock();
        let key = artifact.key();
        if objects.contains_key(&key) {
            return Err(Error::conflict(
                artifact.kind.kind_str(),
                &artifact.name,
                "already exists",
            ));
        }
        let mut stored = artifact.clone();
        stored.resource_version = Some(version);
        objects.insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(&self, artifact: &Artifact) -> Result<(), Error> {
        let version = self.next_version();
        let mut objects = self.lock();
        let key = artifact.key();
        let current = objects
            .get(&key)
            .ok_or_else(|| Error::internal_with_context("memory-store", "replace of missing object"))?;
        if current.resource_version != artifact.resource_version {
            return Err(Error::conflict(
                artifact.kind.kind_str(),
                &artifact.name,
                "resourceVersion mismatch",
            ));
        }
        let mut stored = artifact.clone();
        stored.resource_version = Some(version);
        objects.insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), Error> {
        let mut objects = self.lock();
        let key = artifact.key();
        let Some(current) = objects.get(&key) else {
            return Ok(());
        };
        if artifact.resource_version.is_some()
            && current.resource_version != artifact.resource_version
        {
            return Err(Error::conflict(
                artifact.kind.kind_str(),
                &artifact.name,
                "precondition failed",
            ));
        }
        objects.remove(&key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
