//! Component H: the signature resolver.
//!
//! Computes a non-empty stage's content fingerprint and decides whether an
//! existing artifact can be reused, consulting the fast index (C) first and
//! falling back to the authoritative registry listing (B) on a miss or a
//! stale hit (§4.H).

use color_eyre::Result;
use tracing::instrument;

use kiln_registry_client::registry::{Fingerprint, parse_repository_and_tag};

use crate::fingerprint::{self, PredecessorContext};
use crate::index::FastIndex;
use crate::lock::LockManager;
use crate::registry::Registry;
use crate::stage::{AncestorCheck, StageArena};

/// What the resolver did for one stage, so the conveyor knows whether to
/// hand it to the builder.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ResolvedStage {
    /// The stage is empty; nothing was computed.
    Empty,
    /// An existing artifact was attached; no build needed.
    Reused,
    /// No usable candidate was found; the stage carries a placeholder name
    /// and awaits the builder.
    MarkedForBuild,
}

pub struct Resolver {
    pub project: String,
    pub index: FastIndex,
    pub registry: Registry,
    pub locks: LockManager,
    pub vcs: Option<Box<dyn AncestorCheck + Send + Sync>>,
}

impl Resolver {
    pub fn new(
        project: impl Into<String>,
        index: FastIndex,
        registry: Registry,
        locks: LockManager,
        vcs: Option<Box<dyn AncestorCheck + Send + Sync>>,
    ) -> Self {
        Self {
            project: project.into(),
            index,
            registry,
            locks,
            vcs,
        }
    }

    #[instrument(skip(self, arena))]
    pub async fn resolve(
        &self,
        arena: &mut StageArena,
        stage_index: usize,
        predecessor_non_empty: Option<usize>,
        base_image_id: Option<&str>,
    ) -> Result<ResolvedStage> {
        if arena.get(stage_index).is_empty() {
            return Ok(ResolvedStage::Empty);
        }

        let dependencies = arena.get(stage_index).dependencies(base_image_id);

        let predecessor_fingerprint = predecessor_non_empty.and_then(|p| arena.get(p).fingerprint.clone());
        let predecessor_next_stage_deps = predecessor_non_empty.map(|p| arena.get(p).next_stage_dependencies());

        let signature = {
            let predecessor_context = match (&predecessor_fingerprint, &predecessor_next_stage_deps) {
                (Some(fp), Some(deps)) => Some(PredecessorContext {
                    fingerprint: fp,
                    next_stage_dependencies: deps.as_bytes(),
                }),
                _ => None,
            };
            fingerprint::compute(arena.get(stage_index).name(), dependencies.as_bytes(), predecessor_context)
        };

        {
            let record = arena.get_mut(stage_index);
            record.fingerprint = Some(signature.clone());
            record.dependencies_digest = Some(dependencies);
        }

        if let Some(candidates) = self.index.get(&self.project, &signature).await {
            if let Some(candidate) = arena.get(stage_index).select_cache_image(&candidates, self.vcs_ref()) {
                let (_, _, unique_id) = parse_repository_and_tag(&candidate.name)?;
                // The fast index said this candidate exists; re-confirming it
                // against the registry coming up empty means the index is
                // stale (§4.C, §7's `IndexStale`) — fall through to the
                // reset path rather than trusting the stale entry.
                if let Some(confirmed) = self.registry.get(&self.project, &signature, unique_id).await? {
                    arena.get_mut(stage_index).artifact = Some(confirmed);
                    return Ok(ResolvedStage::Reused);
                }
            }
        }

        self.reset_path(arena, stage_index, &signature).await
    }

    /// Step 6: reacquire truth directly from the registry, repopulate the
    /// fast index, and either attach a freshly confirmed candidate or mark
    /// the stage for building.
    async fn reset_path(&self, arena: &mut StageArena, stage_index: usize, signature: &Fingerprint) -> Result<ResolvedStage> {
        let lock_name = LockManager::stage_cache_name(&self.project, signature);
        let _guard = self.locks.acquire(&lock_name).await?;

        let candidates = self.registry.list_by_fingerprint(&self.project, signature).await?;
        self.index.put(&self.project, signature, candidates.clone()).await;

        match arena.get(stage_index).select_cache_image(&candidates, self.vcs_ref()) {
            Some(candidate) => {
                arena.get_mut(stage_index).artifact = Some(candidate);
                Ok(ResolvedStage::Reused)
            }
            None => {
                arena.get_mut(stage_index).marked_for_build = true;
                Ok(ResolvedStage::MarkedForBuild)
            }
        }
    }

    fn vcs_ref(&self) -> Option<&dyn AncestorCheck> {
        self.vcs.as_deref().map(|v| v as &dyn AncestorCheck)
    }
}
