//! Changing one stage's declared content rebuilds that stage and every
//! stage downstream of it, but leaves untouched stages that precede the
//! change alone.

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

fn three_stage_config(install_command: &str) -> ProjectConfig {
    ProjectConfig {
        project: "demo".into(),
        images: vec![ImageConfig {
            name: "app".into(),
            from: FromRef::BaseImage("alpine:3.19".into()),
            stages: vec![
                StageConfig::BeforeInstall(ShellStageConfig {
                    commands: vec!["mkdir /srv".into()],
                    ..Default::default()
                }),
                StageConfig::Install(ShellStageConfig {
                    commands: vec![install_command.to_string()],
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
async fn changing_one_stage_rebuilds_only_that_stage_and_its_successors() {
    let (_dir, registry) = fresh_local_registry();
    let engine = CountingEngine::new();

    let first = run_once(&three_stage_config("apk add curl"), registry.clone(), engine.clone()).await;
    assert_eq!(engine.call_count(), 3, "beforeInstall, install, and setup all build on a cold run");

    let second = run_once(&three_stage_config("apk add wget"), registry, engine.clone()).await;
    assert_eq!(
        engine.call_count(),
        5,
        "install's new content and setup's new base image each force one more build; beforeInstall is reused"
    );
    assert_ne!(second.images[0].stages_signature, first.images[0].stages_signature);
}
