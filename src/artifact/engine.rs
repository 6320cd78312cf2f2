//! Convergence and release of owned artifacts
//!
//! [`ArtifactEngine::converge`] makes the cluster match a backend's desired
//! set for one owner: it writes what is missing or different, then removes
//! what the owner still holds but no longer wants. Removal goes through the
//! release algorithm, which never deletes an artifact that something outside
//! the removal set still points at. Such artifacts are handed to the owner of
//! the referrer instead, so they are collected when their last user goes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Artifact, ArtifactKey, ArtifactKind, ArtifactStore};
use crate::Error;

/// What a convergence or release pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Artifacts created
    pub created: usize,
    /// Artifacts replaced because their spec drifted
    pub updated: usize,
    /// Desired artifacts already satisfied by the cluster
    pub unchanged: usize,
    /// Artifacts deleted
    pub deleted: usize,
    /// Shared artifacts relabeled to a surviving owner
    pub handed_off: usize,
    /// Shared artifacts left in place without relabeling
    pub retained: usize,
}

impl SyncReport {
    /// Number of API writes the pass performed
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted + self.handed_off
    }

    /// Artifacts that satisfy the desired set after the pass
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

type Population = BTreeMap<(ArtifactKind, String), Vec<Artifact>>;

/// Applies desired sets and garbage-collects through an [`ArtifactStore`]
#[derive(Clone)]
pub struct ArtifactEngine {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactEngine {
    /// Create an engine over a store
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Converge `owner`'s artifacts of `kinds` onto `desired`.
    ///
    /// Garbage collection lists owned artifacts after all writes of the apply
    /// phase, so references created in this pass protect what they point at.
    pub async fn converge(
        &self,
        owner: &str,
        kinds: &[ArtifactKind],
        desired: Vec<Artifact>,
    ) -> Result<SyncReport, Error> {
        let mut report = SyncReport::default();
        let applied = self.apply(owner, desired, &mut report).await?;

        let stale: Vec<Artifact> = self
            .list_owned(owner, kinds)
            .await?
            .into_iter()
            .filter(|a| !applied.contains(&a.key()))
            .collect();

        if !stale.is_empty() {
            debug!(owner = %owner, count = stale.len(), "releasing stale artifacts");
            self.release(kinds, stale, &mut report).await?;
        }
        Ok(report)
    }

    /// Write `desired` for `owner` without collecting anything stale.
    ///
    /// Used when part of the desired set could not be computed this pass.
    pub async fn apply_only(&self, owner: &str, desired: Vec<Artifact>) -> Result<SyncReport, Error> {
        let mut report = SyncReport::default();
        self.apply(owner, desired, &mut report).await?;
        Ok(report)
    }

    /// Release every artifact of `kinds` owned by `owner`
    pub async fn release_all(
        &self,
        owner: &str,
        kinds: &[ArtifactKind],
    ) -> Result<SyncReport, Error> {
        let mut report = SyncReport::default();
        let owned = self.list_owned(owner, kinds).await?;
        if !owned.is_empty() {
            self.release(kinds, owned, &mut report).await?;
        }
        Ok(report)
    }

    async fn list_owned(&self, owner: &str, kinds: &[ArtifactKind]) -> Result<Vec<Artifact>, Error> {
        let mut owned = Vec::new();
        for kind in kinds {
            owned.extend(self.store.list_owned(*kind, owner).await?);
        }
        Ok(owned)
    }

    async fn population<'a>(
        &self,
        cache: &'a mut Population,
        kind: ArtifactKind,
        namespace: &str,
    ) -> Result<&'a mut Vec<Artifact>, Error> {
        let key = (kind, namespace.to_string());
        if !cache.contains_key(&key) {
            let listed = self.store.list_in_namespace(kind, namespace).await?;
            cache.insert(key.clone(), listed);
        }
        cache
            .get_mut(&key)
            .ok_or_else(|| Error::internal_with_context("artifact-engine", "population cache miss"))
    }

    /// Write the desired set and return the keys that now satisfy it
    async fn apply(
        &self,
        owner: &str,
        desired: Vec<Artifact>,
        report: &mut SyncReport,
    ) -> Result<BTreeSet<ArtifactKey>, Error> {
        let mut unique: BTreeMap<ArtifactKey, Artifact> = BTreeMap::new();
        for artifact in desired {
            let key = artifact.key();
            if unique.contains_key(&key) {
                debug!(artifact = %key, "duplicate desired artifact, keeping first");
                continue;
            }
            unique.insert(key, artifact);
        }
        let mut ordered: Vec<Artifact> = unique.into_values().collect();
        ordered.sort_by_key(|a| (a.kind.apply_rank(), a.key()));

        let mut cache = Population::new();
        let mut aliases: Vec<(ArtifactKey, String)> = Vec::new();
        let mut applied = BTreeSet::new();

        for mut artifact in ordered {
            for (target, name) in &aliases {
                artifact.rewrite_reference(target, name);
            }
            let existing = self
                .population(&mut cache, artifact.kind, &artifact.namespace)
                .await?;

            if let Some(current) = existing.iter_mut().find(|e| e.name == artifact.name) {
                if artifact.satisfied_by(current) {
                    report.unchanged += 1;
                    applied.insert(current.key());
                    continue;
                }
                let replacement = merge_for_replace(&artifact, current, owner);
                self.store.replace(&replacement).await?;
                info!(artifact = %replacement.key(), "replaced drifted artifact");
                report.updated += 1;
                applied.insert(replacement.key());
                *current = replacement;
                continue;
            }

            if artifact.kind.is_shareable() {
                if let Some(equivalent) = existing.iter().find(|e| artifact.satisfied_by(e)) {
                    debug!(
                        desired = %artifact.key(),
                        existing = %equivalent.name,
                        "sharing equivalent artifact"
                    );
                    aliases.push((artifact.key(), equivalent.name.clone()));
                    applied.insert(equivalent.key());
                    report.unchanged += 1;
                    continue;
                }
            }

            let artifact = artifact.with_owner(owner);
            self.store.create(&artifact).await?;
            info!(artifact = %artifact.key(), owner = %owner, "created artifact");
            report.created += 1;
            applied.insert(artifact.key());
            existing.push(artifact);
        }

        Ok(applied)
    }

    /// Remove `candidates`, keeping any that a surviving artifact references.
    async fn release(
        &self,
        kinds: &[ArtifactKind],
        candidates: Vec<Artifact>,
        report: &mut SyncReport,
    ) -> Result<(), Error> {
        let namespaces: BTreeSet<String> =
            candidates.iter().map(|c| c.namespace.clone()).collect();
        let mut population = Vec::new();
        for namespace in &namespaces {
            for kind in kinds {
                population.extend(self.store.list_in_namespace(*kind, namespace).await?);
            }
        }

        let plan = plan_release(candidates, &population);

        let mut removals = plan.remove;
        removals.sort_by_key(|a| std::cmp::Reverse((a.kind.apply_rank(), a.key())));
        for artifact in &removals {
            self.store.delete(artifact).await?;
            info!(artifact = %artifact.key(), "deleted artifact");
            report.deleted += 1;
        }

        for (mut artifact, new_owner) in plan.keep {
            match new_owner {
                Some(new_owner) if artifact.owner() != Some(new_owner.as_str()) => {
                    let previous = artifact.owner().unwrap_or_default().to_string();
                    artifact.set_owner(&new_owner);
                    self.store.replace(&artifact).await?;
                    info!(
                        artifact = %artifact.key(),
                        from = %previous,
                        to = %new_owner,
                        "handed off shared artifact"
                    );
                    report.handed_off += 1;
                }
                Some(_) => report.retained += 1,
                None => {
                    warn!(
                        artifact = %artifact.key(),
                        "artifact still referenced by unmanaged resources, leaving it in place"
                    );
                    report.retained += 1;
                }
            }
        }
        Ok(())
    }
}

/// Existing artifact rewritten with the desired spec.
///
/// A foreign owner label is preserved: the artifact stays with whoever
/// created it and this owner's references keep it alive.
fn merge_for_replace(desired: &Artifact, current: &Artifact, owner: &str) -> Artifact {
    let mut merged = current.clone();
    merged.spec = desired.spec.clone();
    let keep_owner = current.owner().map(str::to_string);
    merged.labels.extend(desired.labels.clone());
    merged.annotations.extend(desired.annotations.clone());
    merged.set_owner(keep_owner.as_deref().unwrap_or(owner));
    merged
}

#[derive(Debug, Default)]
struct ReleasePlan {
    remove: Vec<Artifact>,
    keep: Vec<(Artifact, Option<String>)>,
}

/// Split candidates into those to delete and those still referenced.
///
/// Iterates to a fixed point: keeping one candidate can make it a live
/// referrer of another. Each kept candidate's new owner is the lowest owner
/// among its referrers, taking earlier handoffs into account.
fn plan_release(candidates: Vec<Artifact>, population: &[Artifact]) -> ReleasePlan {
    let fresh: BTreeMap<ArtifactKey, &Artifact> =
        population.iter().map(|a| (a.key(), a)).collect();
    let mut removal: BTreeMap<ArtifactKey, Artifact> = candidates
        .into_iter()
        .map(|c| {
            let key = c.key();
            let current = fresh.get(&key).map(|a| (*a).clone()).unwrap_or(c);
            (key, current)
        })
        .collect();
    let mut kept: BTreeMap<ArtifactKey, (Artifact, Option<String>)> = BTreeMap::new();

    loop {
        let mut moved = Vec::new();
        for key in removal.keys() {
            let referrers: Vec<&Artifact> = population
                .iter()
                .filter(|p| {
                    let pk = p.key();
                    pk != *key && !removal.contains_key(&pk) && p.references().contains(key)
                })
                .collect();
            if referrers.is_empty() {
                continue;
            }
            let new_owner = referrers
                .iter()
                .filter_map(|r| match kept.get(&r.key()) {
                    Some((_, handed)) => handed.clone(),
                    None => r.owner().map(str::to_string),
                })
                .min();
            moved.push((key.clone(), new_owner));
        }
        if moved.is_empty() {
            break;
        }
        for (key, new_owner) in moved {
            if let Some(artifact) = removal.remove(&key) {
                kept.insert(key, (artifact, new_owner));
            }
        }
    }

    ReleasePlan {
        remove: removal.into_values().collect(),
        keep: kept.into_values().collect(),
    }
}
