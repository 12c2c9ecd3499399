use clap::Args;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use tracing::instrument;

use kiln::builder::Builder;
use kiln::config::{EngineOptions, ProjectConfig};
use kiln::container::DockerCliEngine;
use kiln::conveyor::{Conveyor, NeverStop};
use kiln::image::Project;
use kiln::index::FastIndex;
use kiln::lock::LockManager;
use kiln::metadata::ImageMetadataStore;
use kiln::resolver::Resolver;
use kiln::stage::AncestorCheck;
use kiln::vcs::SharedVcs;

use crate::wiring;

#[derive(Clone, Debug, Args)]
pub struct Options {
    #[command(flatten)]
    pub engine: EngineOptions,

    /// Compute and print every image's stage signature without building
    /// anything (drives only components G/H, skipping I).
    #[arg(long)]
    pub signatures_only: bool,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<()> {
    let opts = &options.engine;
    let config = ProjectConfig::load(&opts.dir).context("load project config")?;
    let (mut project, mut arena) = Project::from_config(&config);

    let registry = wiring::open_registry(opts, &project.name).await?;
    let index = FastIndex::new();
    let locks = LockManager::new(opts.synchronization_timeout);
    let vcs = wiring::open_vcs(opts).map(SharedVcs::new);

    let resolver = Resolver::new(
        project.name.clone(),
        index.clone(),
        registry.clone(),
        locks.clone(),
        vcs.clone().map(|v| Box::new(v) as Box<dyn AncestorCheck + Send + Sync>),
    );

    let builder = if options.signatures_only {
        None
    } else {
        let commit = vcs.as_ref().and_then(|v| v.head_commit().ok());
        Some(Builder::new(
            project.name.clone(),
            index.clone(),
            registry.clone(),
            ImageMetadataStore::new(registry.clone()),
            locks.clone(),
            Box::new(DockerCliEngine::new()),
            vcs.map(|v| Box::new(v) as Box<dyn AncestorCheck + Send + Sync>),
            commit,
        ))
    };

    let mut conveyor = Conveyor::new(&mut project, &mut arena, &resolver, builder.as_ref());
    conveyor.run(&NeverStop).await?;

    for image in &project.images {
        match &image.stages_signature {
            Some(signature) => println!("{}: {}", image.name, signature.to_hex()),
            None => println!("{}: (no non-empty stages)", image.name),
        }
    }

    Ok(())
}
