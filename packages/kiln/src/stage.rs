//! Component F: the stage contract.
//!
//! Stages are a tagged union (design note in §9: "a tagged union with
//! per-variant method tables... not class inheritance") held in a flat
//! arena and referenced by index, so predecessor/successor links never form
//! an owning-reference cycle. [`StageArena`] is the arena; [`StageRecord`]
//! is one stage's mutable run state; [`StageConfig`] (in [`crate::config`])
//! is the declared, immutable payload per variant.

use std::collections::BTreeMap;

use kiln_registry_client::registry::{ArtifactDescriptor, Fingerprint, Labels, label_keys};

use crate::config::{DockerfileConfig, GitStageConfig, Mount, ShellStageConfig, StageConfig};

/// Queried by [`StageRecord::select_cache_image`] and
/// [`StageRecord::should_be_reset`] for the `gitArchive`-family variants,
/// which additionally require the recorded commit to still be an ancestor
/// of the current `HEAD`. A thin trait rather than a concrete VCS type so
/// stage logic stays free of the `gix` dependency.
pub trait AncestorCheck {
    fn commit_exists(&self, commit: &str) -> bool;
    fn is_ancestor(&self, commit: &str) -> bool;
}

/// One stage's mutable state for the lifetime of a single conveyor run.
#[derive(Clone, Debug)]
pub struct StageRecord {
    pub config: StageConfig,
    pub image_index: usize,

    /// Set by the conveyor before the stage is visited (§4.G); `None` only
    /// for a `from` stage, which has no predecessor by construction.
    pub predecessor: Option<usize>,
    pub predecessor_non_empty: Option<usize>,
    pub predecessor_built: Option<usize>,

    /// Once set, never changes for the lifetime of the run (invariant in
    /// §3).
    pub fingerprint: Option<Fingerprint>,
    pub dependencies_digest: Option<Fingerprint>,

    pub artifact: Option<ArtifactDescriptor>,
    pub marked_for_build: bool,

    /// Per-source-repository commit pins for `gitArchive|gitCache|gitLatestPatch`
    /// stages (§10.6's "per-stage git mappings"). Feeds both the dependency
    /// digest and the per-source commit-id labels.
    pub git_mappings: BTreeMap<String, String>,
}

impl StageRecord {
    pub fn new(config: StageConfig, image_index: usize) -> Self {
        Self {
            config,
            image_index,
            predecessor: None,
            predecessor_non_empty: None,
            predecessor_built: None,
            fingerprint: None,
            dependencies_digest: None,
            artifact: None,
            marked_for_build: false,
            git_mappings: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.config.variant_name()
    }

    /// True when the stage contributes no container-commit work and should
    /// be skipped by the builder (but still advances predecessor links
    /// correctly — an empty stage is never itself a "predecessor-non-empty").
    pub fn is_empty(&self) -> bool {
        match &self.config {
            StageConfig::From => false,
            StageConfig::BeforeInstall(s)
            | StageConfig::Install(s)
            | StageConfig::BeforeSetup(s)
            | StageConfig::Setup(s) => s.commands.is_empty() && s.mounts.is_empty(),
            StageConfig::Import(_) => false,
            StageConfig::GitArchive(g) | StageConfig::GitCache(g) | StageConfig::GitLatestPatch(g) => {
                g.sources.is_empty()
            }
            StageConfig::DockerInstructions(d) => d.instructions.is_empty(),
            StageConfig::Dockerfile(_) => false,
        }
    }

    /// Compute this stage's own dependency digest: a hash over its mounts,
    /// commands, labels, and variant-specific inputs (§3's "declared
    /// dependencies"). `base_image_id` is only meaningful for `from`.
    pub fn dependencies(&self, base_image_id: Option<&str>) -> Fingerprint {
        let mut fields: Vec<Vec<u8>> = vec![self.name().as_bytes().to_vec()];
        match &self.config {
            StageConfig::From => {
                fields.push(base_image_id.unwrap_or_default().as_bytes().to_vec());
            }
            StageConfig::BeforeInstall(s)
            | StageConfig::Install(s)
            | StageConfig::BeforeSetup(s)
            | StageConfig::Setup(s) => shell_fields(s, &mut fields),
            StageConfig::Import(i) => {
                fields.push(i.from_image.as_bytes().to_vec());
                fields.push(i.add.as_bytes().to_vec());
                fields.push(i.to.as_bytes().to_vec());
            }
            StageConfig::GitArchive(g) | StageConfig::GitCache(g) | StageConfig::GitLatestPatch(g) => {
                git_fields(g, &self.git_mappings, &mut fields)
            }
            StageConfig::DockerInstructions(d) => {
                for instruction in &d.instructions {
                    fields.push(instruction.as_bytes().to_vec());
                }
            }
            StageConfig::Dockerfile(d) => dockerfile_fields(d, &mut fields),
        }
        Fingerprint::from_fields(fields)
    }

    /// The predecessor's view of the transition into the next stage: a hash
    /// over the commit ids this stage would pin for whoever follows it.
    /// Meaningful only for git-backed stages; everything else contributes
    /// an empty digest (no commit pinning to propagate).
    pub fn next_stage_dependencies(&self) -> Fingerprint {
        if self.git_mappings.is_empty() {
            return Fingerprint::from_fields([b"" as &[u8]]);
        }
        let fields: Vec<Vec<u8>> = self
            .git_mappings
            .iter()
            .map(|(alias, commit)| format!("{alias}={commit}").into_bytes())
            .collect();
        Fingerprint::from_fields(fields)
    }

    /// Stamp labels onto the prospective artifact (builder step 2/3, §4.I).
    /// The `dockerfile` variant bypasses this (§10.6) — its labels are
    /// injected as build-args at container-engine invocation time instead.
    pub fn prepare_labels(&self, labels: &mut Labels) {
        match &self.config {
            StageConfig::BeforeInstall(s)
            | StageConfig::Install(s)
            | StageConfig::BeforeSetup(s)
            | StageConfig::Setup(s) => {
                for (k, v) in &s.labels {
                    labels.insert(k.clone(), v.clone());
                }
                apply_mounts(&s.mounts, labels);
            }
            StageConfig::GitArchive(g) | StageConfig::GitCache(g) | StageConfig::GitLatestPatch(g) => {
                apply_mounts(&g.mounts, labels);
                for (alias, commit) in &self.git_mappings {
                    labels.insert(format!("kiln-git-commit-{alias}"), commit.clone());
                }
            }
            StageConfig::From
            | StageConfig::Import(_)
            | StageConfig::DockerInstructions(_)
            | StageConfig::Dockerfile(_) => {}
        }
    }

    pub fn is_dockerfile(&self) -> bool {
        matches!(self.config, StageConfig::Dockerfile(_))
    }

    /// Default tie-break: oldest creation time first, to maximize
    /// downstream cache reuse (§4.F). `gitArchive`-family variants
    /// additionally require the recorded commit still be an ancestor of
    /// `HEAD`.
    pub fn select_cache_image(
        &self,
        candidates: &[ArtifactDescriptor],
        vcs: Option<&dyn AncestorCheck>,
    ) -> Option<ArtifactDescriptor> {
        let is_git_family = matches!(
            self.config,
            StageConfig::GitArchive(_) | StageConfig::GitCache(_) | StageConfig::GitLatestPatch(_)
        );
        candidates
            .iter()
            .filter(|candidate| {
                if !is_git_family {
                    return true;
                }
                let Some(vcs) = vcs else { return true };
                git_commit_labels(candidate)
                    .all(|(_, commit)| vcs.is_ancestor(commit) || vcs.commit_exists(commit))
            })
            .min_by_key(|candidate| candidate.created_at)
            .cloned()
    }

    /// True when the cached artifact should be discarded rather than
    /// reused: its recorded commit is no longer resolvable in the
    /// repository. Always false for non-git stages (§8 boundary behavior).
    pub fn should_be_reset(&self, built: &ArtifactDescriptor, vcs: Option<&dyn AncestorCheck>) -> bool {
        let is_git_family = matches!(
            self.config,
            StageConfig::GitArchive(_) | StageConfig::GitCache(_) | StageConfig::GitLatestPatch(_)
        );
        if !is_git_family {
            return false;
        }
        let Some(vcs) = vcs else { return false };
        git_commit_labels(built).any(|(_, commit)| !vcs.commit_exists(commit))
    }
}

fn git_commit_labels(descriptor: &ArtifactDescriptor) -> impl Iterator<Item = (String, &str)> + '_ {
    descriptor
        .labels
        .iter()
        .filter(|(k, _)| k.starts_with("kiln-git-commit-"))
        .map(|(k, v)| (k.trim_start_matches("kiln-git-commit-").to_string(), v))
}

fn shell_fields(s: &ShellStageConfig, fields: &mut Vec<Vec<u8>>) {
    for command in &s.commands {
        fields.push(command.as_bytes().to_vec());
    }
    mount_fields(&s.mounts, fields);
    for (k, v) in &s.labels {
        fields.push(format!("{k}={v}").into_bytes());
    }
}

fn git_fields(g: &GitStageConfig, mappings: &BTreeMap<String, String>, fields: &mut Vec<Vec<u8>>) {
    for source in &g.sources {
        fields.push(source.alias.as_bytes().to_vec());
        fields.push(source.add.as_bytes().to_vec());
        fields.push(source.to.as_bytes().to_vec());
        if let Some(commit) = mappings.get(&source.alias) {
            fields.push(commit.as_bytes().to_vec());
        }
    }
    mount_fields(&g.mounts, fields);
}

fn dockerfile_fields(d: &DockerfileConfig, fields: &mut Vec<Vec<u8>>) {
    fields.push(d.path.to_string_lossy().into_owned().into_bytes());
    for (k, v) in &d.build_args {
        fields.push(format!("{k}={v}").into_bytes());
    }
    if let Some(target) = &d.target {
        fields.push(target.as_bytes().to_vec());
    }
}

fn mount_fields(mounts: &[Mount], fields: &mut Vec<Vec<u8>>) {
    for mount in mounts {
        fields.push(mount_key(mount).into_bytes());
    }
}

fn mount_key(mount: &Mount) -> String {
    match mount {
        Mount::Tmp { path } => format!("tmp:{path}"),
        Mount::Build { path } => format!("build:{path}"),
        Mount::Custom { source_alias, path } => format!("custom:{source_alias}:{path}"),
    }
}

fn apply_mounts(mounts: &[Mount], labels: &mut Labels) {
    let mut tmp = Vec::new();
    let mut build = Vec::new();
    for mount in mounts {
        match mount {
            Mount::Tmp { path } => tmp.push(path.clone()),
            Mount::Build { path } => build.push(path.clone()),
            Mount::Custom { source_alias, path } => {
                labels.insert(Labels::custom_mount_dir_key(source_alias), path.clone());
            }
        }
    }
    if !tmp.is_empty() {
        labels.insert(label_keys::MOUNT_TMP_DIR, tmp.join(";"));
    }
    if !build.is_empty() {
        labels.insert(label_keys::MOUNT_BUILD_DIR, build.join(";"));
    }
}

/// A flat, arena-owned collection of every stage across every image in a
/// project, referenced by index rather than owning pointers (design note
/// in §9: avoids lifetime cycles in the per-stage predecessor/successor
/// links).
#[derive(Clone, Debug, Default)]
pub struct StageArena {
    stages: Vec<StageRecord>,
}

impl StageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: StageRecord) -> usize {
        self.stages.push(record);
        self.stages.len() - 1
    }

    pub fn get(&self, index: usize) -> &StageRecord {
        &self.stages[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut StageRecord {
        &mut self.stages[index]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
