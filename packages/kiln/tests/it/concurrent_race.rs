//! Two builders racing to build the same fingerprint must converge on
//! exactly one published artifact: the loser's critical section re-lists
//! the registry, finds the winner's candidate, and adopts it instead of
//! publishing a second one.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use kiln::builder::Builder;
use kiln::config::{ShellStageConfig, StageConfig};
use kiln::container::{BuildSpec, BuiltImage, ContainerEngine};
use kiln::index::FastIndex;
use kiln::lock::LockManager;
use kiln::metadata::ImageMetadataStore;
use kiln::stage::{StageArena, StageRecord};
use kiln_registry_client::registry::Fingerprint;
use tokio::sync::Barrier;

use crate::support::fresh_local_registry;

/// Every call produces a distinct artifact id, so adoption (rather than two
/// identical builds happening to look the same) is what's actually under
/// test: if the critical section didn't adopt, the registry would end up
/// with two different ids under one fingerprint.
struct DistinctEachCall;
impl ContainerEngine for DistinctEachCall {
    async fn build(&self, _spec: &BuildSpec) -> Result<BuiltImage> {
        Ok(BuiltImage { id: format!("sha256:{}", uuid::Uuid::new_v4()), size_bytes: 1 })
    }
}

#[tokio::test]
async fn concurrent_builders_converge_on_one_published_artifact() {
    let (_dir, registry) = fresh_local_registry();
    let index = FastIndex::new();
    let locks = LockManager::new(Duration::from_secs(5));
    let signature = Fingerprint::from_fields([b"racing-install" as &[u8]]);
    let barrier = Arc::new(Barrier::new(2));

    let race = |barrier: Arc<Barrier>| {
        let builder = Builder::new(
            "demo",
            index.clone(),
            registry.clone(),
            ImageMetadataStore::new(registry.clone()),
            locks.clone(),
            Box::new(DistinctEachCall),
            None,
            None,
        );
        let signature = signature.clone();
        async move {
            let mut arena = StageArena::new();
            let stage = arena.push(StageRecord::new(
                StageConfig::Install(ShellStageConfig {
                    commands: vec!["apk add curl".into()],
                    ..Default::default()
                }),
                0,
            ));
            arena.get_mut(stage).fingerprint = Some(signature);
            arena.get_mut(stage).marked_for_build = true;

            barrier.wait().await;
            builder.build(&mut arena, stage, None, "app", true).await.unwrap();
            arena.get(stage).artifact.clone().unwrap().id
        }
    };

    let (id_a, id_b) = tokio::join!(race(barrier.clone()), race(barrier));
    assert_eq!(id_a, id_b, "both builders must converge on the same published artifact");

    let published = registry.list_by_fingerprint("demo", &signature).await.unwrap();
    assert_eq!(published.len(), 1, "exactly one artifact must survive the race");
}
