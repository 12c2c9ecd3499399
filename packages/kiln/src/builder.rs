//! Component I: the builder.
//!
//! Builds a stage that the resolver marked for building, then runs the
//! critical section that decides between publishing the freshly built
//! artifact and adopting one a concurrent builder already published under
//! the same fingerprint (§4.I). At-most-one distinct artifact ever survives
//! per `(project, fingerprint)` in the long run.

use std::collections::BTreeMap;

use color_eyre::Result;
use jiff::Timestamp;
use tracing::instrument;

use kiln_registry_client::registry::{
    ArtifactDescriptor, Fingerprint, Labels, TagStrategy, construct_name, label_keys, next_unique_id,
};

use crate::container::{BuildSpec, ContainerEngine, DockerfileSpec, MountSpec};
use crate::index::FastIndex;
use crate::lock::LockManager;
use crate::metadata::ImageMetadataStore;
use crate::registry::{Registry, stages_repository};
use crate::stage::{AncestorCheck, StageArena};

/// One instance drives every image in a project's conveyor run; the image
/// a given build belongs to is passed into [`Builder::build`] rather than
/// fixed at construction, since the conveyor iterates all of a project's
/// images through a single shared builder.
pub struct Builder {
    pub project: String,
    pub index: FastIndex,
    pub registry: Registry,
    pub metadata: ImageMetadataStore,
    pub locks: LockManager,
    pub engine: Box<dyn ContainerEngineObj>,
    pub vcs: Option<Box<dyn AncestorCheck + Send + Sync>>,
    /// The commit this run is building against, when known (§3: an
    /// image-metadata record is only created "when a corresponding commit
    /// is known"). `None` outside a git working tree.
    pub commit: Option<String>,
}

/// Object-safe wrapper so [`Builder`] can hold any [`ContainerEngine`]
/// behind a trait object (the trait itself isn't object-safe because of its
/// RPITIT method).
pub trait ContainerEngineObj: Send + Sync {
    fn build<'a>(&'a self, spec: &'a BuildSpec) -> futures::future::BoxFuture<'a, Result<crate::container::BuiltImage>>;
}

impl<T: ContainerEngine + Send + Sync> ContainerEngineObj for T {
    fn build<'a>(&'a self, spec: &'a BuildSpec) -> futures::future::BoxFuture<'a, Result<crate::container::BuiltImage>> {
        Box::pin(ContainerEngine::build(self, spec))
    }
}

impl Builder {
    pub fn new(
        project: impl Into<String>,
        index: FastIndex,
        registry: Registry,
        metadata: ImageMetadataStore,
        locks: LockManager,
        engine: Box<dyn ContainerEngineObj>,
        vcs: Option<Box<dyn AncestorCheck + Send + Sync>>,
        commit: Option<String>,
    ) -> Self {
        Self {
            project: project.into(),
            index,
            registry,
            metadata,
            locks,
            engine,
            vcs,
            commit,
        }
    }

    /// `is_terminal` marks this stage as the image's `last_non_empty_stage`:
    /// if this call is the one that actually wins the build race, it gets
    /// registered as a managed image (§10.6 — adoption and pure cache hits
    /// never register one).
    #[instrument(skip(self, arena))]
    pub async fn build(
        &self,
        arena: &mut StageArena,
        stage_index: usize,
        predecessor_built: Option<usize>,
        image_name: &str,
        is_terminal: bool,
    ) -> Result<()> {
        if arena.get(stage_index).artifact.is_some() {
            return Ok(());
        }

        let signature = arena
            .get(stage_index)
            .fingerprint
            .clone()
            .expect("resolver assigns a fingerprint before marking a stage for build");

        let base_image = predecessor_built
            .and_then(|p| arena.get(p).artifact.as_ref())
            .map(|artifact| artifact.id.clone())
            .unwrap_or_default();

        let spec = self.build_spec(arena, stage_index, &base_image);
        let built = self.engine.build(&spec).await?;

        let (descriptor, published) = self
            .critical_section(arena, stage_index, &signature, built, image_name)
            .await?;
        if is_terminal && published {
            self.registry.add_managed_image(&self.project, image_name).await?;
            if let Some(commit) = &self.commit {
                self.metadata.put(&self.project, image_name, commit, signature.clone()).await?;
            }
        }
        arena.get_mut(stage_index).artifact = Some(descriptor);
        Ok(())
    }

    fn build_spec(&self, arena: &StageArena, stage_index: usize, base_image: &str) -> BuildSpec {
        let record = arena.get(stage_index);
        if let crate::config::StageConfig::Dockerfile(d) = &record.config {
            return BuildSpec {
                base_image: base_image.to_string(),
                commands: Vec::new(),
                mounts: Vec::new(),
                labels: BTreeMap::new(),
                dockerfile: Some(DockerfileSpec {
                    path: d.path.to_string_lossy().into_owned(),
                    context: ".".to_string(),
                    build_args: d.build_args.clone(),
                    target: d.target.clone(),
                }),
            };
        }

        let mut labels = Labels::new();
        record.prepare_labels(&mut labels);
        let labels: BTreeMap<String, String> = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        let (commands, mounts) = match &record.config {
            crate::config::StageConfig::BeforeInstall(s)
            | crate::config::StageConfig::Install(s)
            | crate::config::StageConfig::BeforeSetup(s)
            | crate::config::StageConfig::Setup(s) => (s.commands.clone(), to_mount_specs(&s.mounts)),
            crate::config::StageConfig::GitArchive(g)
            | crate::config::StageConfig::GitCache(g)
            | crate::config::StageConfig::GitLatestPatch(g) => (Vec::new(), to_mount_specs(&g.mounts)),
            crate::config::StageConfig::DockerInstructions(d) => (d.instructions.clone(), Vec::new()),
            crate::config::StageConfig::From | crate::config::StageConfig::Import(_) => (Vec::new(), Vec::new()),
            crate::config::StageConfig::Dockerfile(_) => unreachable!("handled above"),
        };

        BuildSpec {
            base_image: base_image.to_string(),
            commands,
            mounts,
            labels,
            dockerfile: None,
        }
    }

    /// §4.I step 4: acquire `stage(project, sig)`, re-list, adopt a
    /// concurrent winner if one now exists, otherwise publish. The second
    /// return value is `true` only when this call's critical section is the
    /// one that actually published (as opposed to adopting a competitor).
    async fn critical_section(
        &self,
        arena: &StageArena,
        stage_index: usize,
        signature: &Fingerprint,
        built: crate::container::BuiltImage,
        image_name: &str,
    ) -> Result<(ArtifactDescriptor, bool)> {
        let lock_name = LockManager::stage_name(&self.project, signature);
        let guard = self.locks.acquire(&lock_name).await?;

        let candidates = self.reset_index(signature, &guard).await?;

        let vcs = self.vcs.as_deref().map(|v| v as &dyn AncestorCheck);
        if let Some(winner) = arena.get(stage_index).select_cache_image(&candidates, vcs) {
            return Ok((winner, false));
        }

        let taken: Vec<_> = candidates
            .iter()
            .filter_map(|c| kiln_registry_client::registry::parse_repository_and_tag(&c.name).ok())
            .map(|(_, _, unique_id)| unique_id)
            .collect();
        let now_millis = Timestamp::now().as_millisecond().max(0) as u64;
        let unique_id = next_unique_id(now_millis, &taken);
        let name = construct_name(&stages_repository(&self.project), signature, unique_id);

        let mut labels = Labels::new();
        labels.insert(label_keys::PROJECT, &self.project);
        labels.insert(label_keys::ENGINE_VERSION, crate::ENGINE_VERSION);
        labels.insert(label_keys::CACHE_VERSION, crate::fingerprint::CACHE_VERSION);
        labels.insert(label_keys::STAGE_SIGNATURE, signature.to_hex());
        labels.insert(label_keys::QUALIFIED_NAME, &name);
        labels.insert(label_keys::IMAGE_TAG, image_name);
        labels.insert(label_keys::IS_IMAGE, "false");
        labels.insert(label_keys::TAG_STRATEGY, TagStrategy::StagesSignature.to_string());
        arena.get(stage_index).prepare_labels(&mut labels);

        let descriptor = ArtifactDescriptor::builder()
            .name(name.clone())
            .repository(stages_repository(&self.project))
            .tag(name.rsplit_once(':').map(|(_, tag)| tag.to_string()).unwrap_or_default())
            .id(built.id)
            .size_bytes(built.size_bytes)
            .created_at(Timestamp::now())
            .labels(labels)
            .build();

        let published = self.registry.publish(&self.project, descriptor).await?;
        {
            let cache_lock_name = LockManager::stage_cache_name(&self.project, signature);
            let _cache_guard = self.locks.acquire_nested(&cache_lock_name, &guard).await?;
            let mut updated = candidates;
            updated.push(published.clone());
            self.index.put(&self.project, signature, updated).await;
        }

        Ok((published, true))
    }

    /// §4.I step 4a: re-list the registry and repopulate the fast index
    /// under `stage-cache(project, sig)`, mirroring the resolver's reset
    /// path so a concurrent `reset_path` can never interleave its index
    /// write with this one (§5 invariant (ii)). Nested under the
    /// already-held `stage` lock's holder identity (§4.D).
    async fn reset_index(&self, signature: &Fingerprint, held: &crate::lock::LockGuard) -> Result<Vec<ArtifactDescriptor>> {
        let cache_lock_name = LockManager::stage_cache_name(&self.project, signature);
        let _cache_guard = self.locks.acquire_nested(&cache_lock_name, held).await?;
        let candidates = self.registry.list_by_fingerprint(&self.project, signature).await?;
        self.index.put(&self.project, signature, candidates.clone()).await;
        Ok(candidates)
    }
}

fn to_mount_specs(mounts: &[crate::config::Mount]) -> Vec<MountSpec> {
    mounts
        .iter()
        .filter_map(|m| match m {
            crate::config::Mount::Tmp { path } => Some(MountSpec {
                host_path: format!("/tmp{path}"),
                container_path: path.clone(),
            }),
            crate::config::Mount::Build { path } => Some(MountSpec {
                host_path: format!("/build{path}"),
                container_path: path.clone(),
            }),
            crate::config::Mount::Custom { .. } => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShellStageConfig, StageConfig};
    use crate::registry::local::LocalRegistry;
    use crate::stage::StageRecord;
    use std::time::Duration;

    struct AlwaysSucceeds;
    impl ContainerEngine for AlwaysSucceeds {
        async fn build(&self, _spec: &BuildSpec) -> Result<crate::container::BuiltImage> {
            Ok(crate::container::BuiltImage {
                id: "sha256:built".to_string(),
                size_bytes: 42,
            })
        }
    }

    fn builder() -> Builder {
        let registry = Registry::Local(LocalRegistry::in_memory().unwrap());
        Builder::new(
            "demo",
            FastIndex::new(),
            registry.clone(),
            ImageMetadataStore::new(registry),
            LockManager::new(Duration::from_secs(1)),
            Box::new(AlwaysSucceeds),
            None,
            Some("deadbeef".to_string()),
        )
    }

    #[tokio::test]
    async fn build_publishes_a_new_artifact() {
        let builder = builder();
        let mut arena = StageArena::new();
        let index = arena.push(StageRecord::new(
            StageConfig::Install(ShellStageConfig {
                commands: vec!["apk add curl".into()],
                ..Default::default()
            }),
            0,
        ));
        arena.get_mut(index).fingerprint = Some(Fingerprint::from_fields([b"x" as &[u8]]));
        arena.get_mut(index).marked_for_build = true;

        builder.build(&mut arena, index, None, "app", true).await.unwrap();
        assert!(arena.get(index).artifact.is_some());
        assert_eq!(
            builder.registry.list_managed_images("demo").await.unwrap(),
            vec!["app".to_string()]
        );
        assert_eq!(
            builder.metadata.list_commits("demo", "app").await.unwrap(),
            vec!["deadbeef".to_string()]
        );
    }

    #[tokio::test]
    async fn non_terminal_build_does_not_register_a_managed_image() {
        let builder = builder();
        let mut arena = StageArena::new();
        let index = arena.push(StageRecord::new(
            StageConfig::Install(ShellStageConfig {
                commands: vec!["apk add curl".into()],
                ..Default::default()
            }),
            0,
        ));
        arena.get_mut(index).fingerprint = Some(Fingerprint::from_fields([b"x" as &[u8]]));
        arena.get_mut(index).marked_for_build = true;

        builder.build(&mut arena, index, None, "app", false).await.unwrap();
        assert!(builder.registry.list_managed_images("demo").await.unwrap().is_empty());
    }
}
