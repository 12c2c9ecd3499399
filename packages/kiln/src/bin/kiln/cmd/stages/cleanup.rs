use clap::Args;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use tracing::instrument;

use kiln::cleanup::CleanupEngine;
use kiln::config::{EngineOptions, ProjectConfig};
use kiln::metadata::ImageMetadataStore;

use crate::wiring;

#[derive(Clone, Debug, Args)]
pub struct Options {
    #[command(flatten)]
    pub engine: EngineOptions,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<()> {
    let opts = &options.engine;
    let config = ProjectConfig::load(&opts.dir).context("load project config")?;

    let registry = wiring::open_registry(opts, &config.project).await?;
    let metadata = ImageMetadataStore::new(registry.clone());
    let engine = CleanupEngine::new(config.project.clone(), registry, metadata, None, None, opts.dry_run);

    let valid_images: Vec<String> = config.images.iter().map(|image| image.name.clone()).collect();
    let report = engine.stages_cleanup(&valid_images).await?;

    println!("deleted {} retained {}", report.deleted.len(), report.retained.len());
    Ok(())
}
