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

    /// Namespaces to scope the in-use whitelist to; ignored when
    /// `--force` or `--check-all-namespaces` is set.
    #[arg(long = "namespace", env = "KILN_NAMESPACE")]
    pub namespaces: Vec<String>,

    /// Delete every artifact regardless of whether a live cluster still
    /// references it.
    #[arg(long)]
    pub force: bool,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<()> {
    let opts = &options.engine;
    let config = ProjectConfig::load(&opts.dir).context("load project config")?;

    let registry = wiring::open_registry(opts, &config.project).await?;
    let metadata = ImageMetadataStore::new(registry.clone());
    let cluster = if options.force { None } else { wiring::open_cluster(opts).await? };

    let engine = CleanupEngine::new(config.project.clone(), registry, metadata, None, cluster, opts.dry_run);

    let namespaces = wiring::resolve_namespaces(opts.check_all_namespaces, &options.namespaces);
    let report = engine.purge(options.force, &namespaces).await?;

    println!("deleted {} retained {}", report.deleted.len(), report.retained.len());
    Ok(())
}
