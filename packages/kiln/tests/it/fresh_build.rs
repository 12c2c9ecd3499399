//! A fresh project builds every non-empty stage exactly once, and a second
//! run against the same registry (but a cold fast index, as a new process
//! would start with) reuses every stage instead of rebuilding.

use std::time::Duration;

use kiln::builder::Builder;
use kiln::config::{FromRef, ImageConfig, ProjectConfig, ShellStageConfig, StageConfig};
use kiln::conveyor::{Conveyor, NeverStop};
use kiln::image::Project;
use kiln::index::FastIndex;
use kiln::lock::LockManager;
use kiln::metadata::ImageMetadataStore;
use kiln::registry::Registry;
use kiln::resolver::Resolver;

use crate::support::{fresh_local_registry, CountingEngine};

fn demo_config() -> ProjectConfig {
    ProjectConfig {
        project: "demo".into(),
        images: vec![ImageConfig {
            name: "app".into(),
            from: FromRef::BaseImage("alpine:3.19".into()),
            stages: vec![
                StageConfig::Install(ShellStageConfig {
                    commands: vec!["apk add curl".into()],
                    ..Default::default()
                }),
                StageConfig::Setup(ShellStageConfig {
                    commands: vec!["echo ready".into()],
                    ..Default::default()
                }),
            ],
        }],
    }
}

async fn run_once(config: &ProjectConfig, registry: Registry, engine: CountingEngine) -> Project {
    let (mut project, mut arena) = Project::from_config(config);
    let index = FastIndex::new();
    let locks = LockManager::new(Duration::from_secs(1));
    let resolver = Resolver::new(project.name.clone(), index.clone(), registry.clone(), locks.clone(), None);
    let builder = Builder::new(
        project.name.clone(),
        index,
        registry.clone(),
        ImageMetadataStore::new(registry),
        locks,
        Box::new(engine),
        None,
        None,
    );
    let mut conveyor = Conveyor::new(&mut project, &mut arena, &resolver, Some(&builder));
    conveyor.run(&NeverStop).await.unwrap();
    project
}

#[tokio::test]
async fn fresh_build_then_fully_cached_rerun() {
    let config = demo_config();
    let (_dir, registry) = fresh_local_registry();
    let engine = CountingEngine::new();

    let first = run_once(&config, registry.clone(), engine.clone()).await;
    assert!(first.images[0].stages_signature.is_some());
    assert_eq!(engine.call_count(), 3, "from, install, and setup each need a first build");

    let second = run_once(&config, registry, engine.clone()).await;
    assert_eq!(second.images[0].stages_signature, first.images[0].stages_signature);
    assert_eq!(engine.call_count(), 3, "a cold fast index against a warm registry must not trigger a rebuild");
}
