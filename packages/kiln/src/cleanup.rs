//! Component J: the cleanup engine.
//!
//! Two disciplines share one entry shape: **legacy** (non-existent VCS
//! primitives plus per-strategy age/count limits) and **history-based**
//! (retention driven by walking VCS history against image-metadata
//! records). Both are always preceded by the whitelist pass: anything a
//! live cluster still references is excepted before either discipline
//! runs, and re-merged into the final retained set (§4.J).

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use color_eyre::Result;
use jiff::Timestamp;
use tracing::{instrument, warn};

use kiln_registry_client::registry::{ArtifactDescriptor, TagStrategy, label_keys};

use crate::cluster::InUseCollector;
use crate::config::CleanupMode;
use crate::metadata::ImageMetadataStore;
use crate::registry::Registry;
use crate::vcs::{RefKind, ScanRef, Vcs};

/// Per-strategy age/count limits for the legacy discipline (§4.J's "policy
/// pass").
#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyLimits {
    pub expiry: Option<Duration>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LegacyPolicyConfig {
    pub git_tag: PolicyLimits,
    pub git_branch: PolicyLimits,
    pub git_commit: PolicyLimits,
    pub stages_signature: PolicyLimits,
}

/// A named ref to scan during the history-based pass, with its own
/// limit/expiry (user-provided keep-policies, §4.J step 3).
#[derive(Clone, Debug)]
pub struct KeepPolicy {
    pub scan_ref: ScanRef,
    pub limit: Option<usize>,
    pub expiry: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<ArtifactDescriptor>,
    pub retained: Vec<ArtifactDescriptor>,
    pub warned: Vec<ArtifactDescriptor>,
}

pub struct CleanupEngine {
    pub project: String,
    pub registry: Registry,
    pub metadata: ImageMetadataStore,
    pub vcs: Option<Vcs>,
    pub cluster: Option<InUseCollector>,
    pub dry_run: bool,
}

impl CleanupEngine {
    pub fn new(
        project: impl Into<String>,
        registry: Registry,
        metadata: ImageMetadataStore,
        vcs: Option<Vcs>,
        cluster: Option<InUseCollector>,
        dry_run: bool,
    ) -> Self {
        Self {
            project: project.into(),
            registry,
            metadata,
            vcs,
            cluster,
            dry_run,
        }
    }

    /// Drop every artifact for the project unconditionally; `force` allows
    /// overriding the in-use whitelist too (the `purge` action, §6).
    #[instrument(skip(self))]
    pub async fn purge(&self, force: bool, namespaces: &[String]) -> Result<CleanupReport> {
        let all = self.registry.list_managed_artifacts(&self.project).await?;
        let whitelist = if force {
            BTreeSet::new()
        } else {
            self.whitelist(namespaces).await?
        };
        let mut report = CleanupReport::default();
        for artifact in all {
            if whitelist.contains(&artifact.id) {
                report.retained.push(artifact);
                continue;
            }
            self.delete(&artifact).await?;
            report.deleted.push(artifact);
        }
        Ok(report)
    }

    #[instrument(skip(self, legacy_config, keep_policies))]
    pub async fn cleanup(
        &self,
        mode: CleanupMode,
        legacy_config: &LegacyPolicyConfig,
        keep_policies: &[KeepPolicy],
        namespaces: &[String],
    ) -> Result<CleanupReport> {
        let all = self.registry.list_managed_artifacts(&self.project).await?;
        let whitelist = self.whitelist(namespaces).await?;

        let (excepted, candidates): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|a| whitelist.contains(&a.id));

        let mut report = CleanupReport {
            retained: excepted,
            ..Default::default()
        };

        let surviving = match mode {
            CleanupMode::Legacy => self.legacy_pass(candidates, legacy_config, &mut report).await?,
            CleanupMode::HistoryBased { v1_2 } => {
                self.history_based_pass(candidates, keep_policies, v1_2, &mut report).await?
            }
        };

        report.retained.extend(surviving);
        Ok(report)
    }

    /// The `stages cleanup` action (§6): drop stage artifacts whose image
    /// counterpart is no longer among `valid_images` — the project's
    /// currently configured image names, standing in for the external
    /// images-repo collaborator (§1's non-goals leave that client
    /// unspecified; every published artifact already carries its owning
    /// image's name under `kiln-image-tag`, §6, so comparing against the
    /// live configuration is sufficient).
    #[instrument(skip(self, valid_images))]
    pub async fn stages_cleanup(&self, valid_images: &[String]) -> Result<CleanupReport> {
        let all = self.registry.list_managed_artifacts(&self.project).await?;
        let mut report = CleanupReport::default();
        for artifact in all {
            let owner = artifact.labels.get(label_keys::IMAGE_TAG);
            let orphaned = match owner {
                Some(name) => !valid_images.iter().any(|v| v == name),
                None => true,
            };
            if orphaned {
                self.delete(&artifact).await?;
                report.deleted.push(artifact);
            } else {
                report.retained.push(artifact);
            }
        }
        Ok(report)
    }

    async fn whitelist(&self, namespaces: &[String]) -> Result<BTreeSet<String>> {
        match &self.cluster {
            Some(cluster) => cluster.collect(namespaces).await,
            None => Ok(BTreeSet::new()),
        }
    }

    async fn delete(&self, artifact: &ArtifactDescriptor) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.registry.delete(&self.project, artifact).await
    }

    /// Non-existent-primitive pass, then per-strategy policy pass (§4.J).
    async fn legacy_pass(
        &self,
        candidates: Vec<ArtifactDescriptor>,
        config: &LegacyPolicyConfig,
        report: &mut CleanupReport,
    ) -> Result<Vec<ArtifactDescriptor>> {
        let mut surviving = Vec::new();
        for artifact in candidates {
            if self.primitive_exists(&artifact) {
                surviving.push(artifact);
            } else {
                self.delete(&artifact).await?;
                report.deleted.push(artifact);
            }
        }

        let mut by_strategy: HashMap<TagStrategy, Vec<ArtifactDescriptor>> = HashMap::new();
        for artifact in surviving {
            let strategy = artifact.tag_strategy().unwrap_or(TagStrategy::Custom);
            by_strategy.entry(strategy).or_default().push(artifact);
        }

        let mut kept = Vec::new();
        for (strategy, mut group) in by_strategy {
            group.sort_by_key(|a| a.created_at);
            let limits = match strategy {
                TagStrategy::GitTag => config.git_tag,
                TagStrategy::GitBranch => config.git_branch,
                TagStrategy::GitCommit => config.git_commit,
                TagStrategy::StagesSignature => config.stages_signature,
                TagStrategy::Custom => PolicyLimits::default(),
            };

            let cutoff = limits.expiry.and_then(|expiry| {
                let micros = i64::try_from(expiry.as_micros()).ok()?;
                Timestamp::now().checked_sub(jiff::SignedDuration::from_micros(micros)).ok()
            });
            let mut remaining = Vec::new();
            for artifact in group {
                if let Some(cutoff) = cutoff {
                    if artifact.created_at < cutoff {
                        self.delete(&artifact).await?;
                        report.deleted.push(artifact);
                        continue;
                    }
                }
                remaining.push(artifact);
            }

            if let Some(limit) = limits.limit {
                while remaining.len() > limit {
                    let artifact = remaining.remove(0);
                    self.delete(&artifact).await?;
                    report.deleted.push(artifact);
                }
            }
            kept.extend(remaining);
        }
        Ok(kept)
    }

    fn primitive_exists(&self, artifact: &ArtifactDescriptor) -> bool {
        let Some(strategy) = artifact.tag_strategy() else {
            return true;
        };
        let Some(meta_tag) = artifact.labels.get(label_keys::IMAGE_TAG) else {
            return true;
        };
        let Some(vcs) = &self.vcs else {
            return true;
        };
        match strategy {
            TagStrategy::GitTag => vcs.tags().map(|tags| tags.iter().any(|t| t == meta_tag)).unwrap_or(true),
            TagStrategy::GitBranch => vcs
                .branches()
                .map(|branches| branches.iter().any(|b| b == meta_tag))
                .unwrap_or(true),
            TagStrategy::GitCommit => vcs.commit_exists(meta_tag),
            TagStrategy::StagesSignature | TagStrategy::Custom => true,
        }
    }

    /// §4.J's history-based pass, steps 1-6.
    async fn history_based_pass(
        &self,
        candidates: Vec<ArtifactDescriptor>,
        keep_policies: &[KeepPolicy],
        v1_2: bool,
        report: &mut CleanupReport,
    ) -> Result<Vec<ArtifactDescriptor>> {
        let Some(vcs) = &self.vcs else {
            return Ok(candidates);
        };

        let images: BTreeSet<String> = candidates
            .iter()
            .filter_map(|a| a.labels.get(label_keys::IMAGE_TAG).map(str::to_string))
            .collect();

        // Step 1: extant commits, grouped by (image, fingerprint).
        let mut reachable_by_ref_target: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut fingerprint_has_extant_commit: BTreeSet<String> = BTreeSet::new();
        for image in &images {
            for commit in self.metadata.list_commits(&self.project, image).await? {
                if !vcs.commit_exists(&commit) {
                    continue;
                }
                if let Some(record) = self.metadata.get(&self.project, image, &commit).await? {
                    fingerprint_has_extant_commit.insert(record.fingerprint.to_hex());
                    reachable_by_ref_target.entry(commit).or_default().insert(record.fingerprint.to_hex());
                }
            }
        }

        // Step 2: flag fingerprints with no extant commit, unless v1.2 is off.
        // Artifacts warned-and-retained for backward compatibility are kept
        // out of `surviving` entirely — they have no extant commit, so they
        // can never be `reached` by the history walk below, and must not be
        // run through step 5's reachability filter.
        let mut surviving = Vec::new();
        for artifact in candidates {
            let fingerprint = match artifact.fingerprint() {
                Ok(fp) => fp.to_hex(),
                Err(_) => {
                    surviving.push(artifact);
                    continue;
                }
            };
            if !fingerprint_has_extant_commit.contains(&fingerprint) {
                if v1_2 {
                    self.delete(&artifact).await?;
                    report.deleted.push(artifact);
                } else {
                    warn!(name = %artifact.name, "fingerprint has no extant commit; retaining for backward compatibility");
                    report.warned.push(artifact.clone());
                    report.retained.push(artifact);
                }
                continue;
            }
            surviving.push(artifact);
        }

        // Steps 3-4: walk each keep-policy's ref, marking reached fingerprints.
        let mut reached: BTreeSet<String> = BTreeSet::new();
        for policy in keep_policies {
            let Some(start) = vcs.resolve_ref(&policy.scan_ref.name)? else {
                continue;
            };
            let mut depth = 0usize;
            let expiry_cutoff = policy.expiry.and_then(|expiry| {
                let micros = i64::try_from(expiry.as_micros()).ok()?;
                Timestamp::now().checked_sub(jiff::SignedDuration::from_micros(micros)).ok()
            });
            vcs.walk_history(&start, |commit| {
                // A commit older than the policy's expiry stops the walk
                // outright — it and everything further back are too old to
                // count as reached.
                if let Some(cutoff) = expiry_cutoff {
                    if vcs.commit_time(commit).is_ok_and(|time| time < cutoff) {
                        return false;
                    }
                }
                if let Some(targets) = reachable_by_ref_target.get(commit) {
                    reached.extend(targets.iter().cloned());
                }
                depth += 1;
                let limit_exhausted = policy.limit.is_some_and(|limit| depth >= limit);
                let all_reached = fingerprint_has_extant_commit.iter().all(|fp| reached.contains(fp));
                !(limit_exhausted || all_reached)
            })?;
        }

        // Step 5: retain reached, delete the rest.
        let mut kept = Vec::new();
        for artifact in surviving {
            let fingerprint = artifact.fingerprint().ok().map(|fp| fp.to_hex());
            match fingerprint {
                Some(fp) if reached.contains(&fp) => kept.push(artifact),
                _ => {
                    self.delete(&artifact).await?;
                    report.deleted.push(artifact);
                }
            }
        }

        // Step 6: purge metadata records whose fingerprint no longer backs
        // any artifact.
        let backed: BTreeSet<String> = kept.iter().filter_map(|a| a.fingerprint().ok()).map(|fp| fp.to_hex()).collect();
        for image in &images {
            for commit in self.metadata.list_commits(&self.project, image).await? {
                if let Some(record) = self.metadata.get(&self.project, image, &commit).await? {
                    if !backed.contains(&record.fingerprint.to_hex()) {
                        self.metadata.remove(&self.project, image, &commit).await?;
                    }
                }
            }
        }

        Ok(kept)
    }
}

pub fn ref_kind_label(kind: RefKind) -> &'static str {
    match kind {
        RefKind::Tag => "tag",
        RefKind::Branch => "branch",
    }
}
