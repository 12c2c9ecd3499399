//! A fast-index entry that thinks nothing is cached for a fingerprint (as
//! an evicted or never-synced entry would) must not force a rebuild: the
//! resolver's reset path re-lists the registry directly and self-heals.

use std::time::Duration;

use kiln::builder::Builder;
use kiln::config::{FromRef, ImageConfig, ProjectConfig, ShellStageConfig, StageConfig};
use kiln::conveyor::{Conveyor, NeverStop};
use kiln::image::Project;
use kiln::index::FastIndex;
use kiln::lock::LockManager;
use kiln::metadata::ImageMetadataStore;
use kiln::resolver::Resolver;

use crate::support::{fresh_local_registry, CountingEngine};

fn config() -> ProjectConfig {
    ProjectConfig {
        project: "demo".into(),
        images: vec![ImageConfig {
            name: "app".into(),
            from: FromRef::BaseImage("alpine:3.19".into()),
            stages: vec![StageConfig::Install(ShellStageConfig {
                commands: vec!["apk add curl".into()],
                ..Default::default()
            })],
        }],
    }
}

#[tokio::test]
async fn stale_fast_index_entry_self_heals_via_the_registry() {
    let config = config();
    let (_dir, registry) = fresh_local_registry();
    let engine = CountingEngine::new();
    let locks = LockManager::new(Duration::from_secs(1));

    let (mut project, mut arena) = Project::from_config(&config);
    let resolver = Resolver::new("demo", FastIndex::new(), registry.clone(), locks.clone(), None);
    let builder = Builder::new(
        "demo",
        FastIndex::new(),
        registry.clone(),
        ImageMetadataStore::new(registry.clone()),
        locks.clone(),
        Box::new(engine.clone()),
        None,
        None,
    );
    let mut conveyor = Conveyor::new(&mut project, &mut arena, &resolver, Some(&builder));
    conveyor.run(&NeverStop).await.unwrap();
    assert_eq!(engine.call_count(), 1);

    let install_stage = project.images[0].stages[1];
    let signature = arena.get(install_stage).fingerprint.clone().unwrap();

    // A fresh process's cold index, but primed with a stale empty entry for
    // the exact fingerprint it's about to resolve — as if an earlier sync
    // had recorded "nothing here" right before this artifact was published.
    let stale_index = FastIndex::new();
    stale_index.put("demo", &signature, Vec::new()).await;

    let (mut project2, mut arena2) = Project::from_config(&config);
    let resolver2 = Resolver::new("demo", stale_index.clone(), registry.clone(), locks.clone(), None);
    let builder2 = Builder::new(
        "demo",
        stale_index,
        registry.clone(),
        ImageMetadataStore::new(registry),
        locks,
        Box::new(engine.clone()),
        None,
        None,
    );
    let mut conveyor2 = Conveyor::new(&mut project2, &mut arena2, &resolver2, Some(&builder2));
    conveyor2.run(&NeverStop).await.unwrap();

    assert_eq!(engine.call_count(), 1, "the stale index entry must not force a rebuild");
    assert_eq!(project2.images[0].stages_signature, project.images[0].stages_signature);
}
