//! Assembles the library's components from [`kiln::config::EngineOptions`]
//! the way each `cmd` handler needs them. Kept out of the library itself:
//! the engine takes its collaborators as explicit arguments (§9's design
//! note), and deciding which concrete registry/VCS/cluster backend to hand
//! it is the entry point's job, not the engine's.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::warn;

use kiln::cluster::InUseCollector;
use kiln::config::{EngineOptions, RegistryTarget};
use kiln::registry::local::LocalRegistry;
use kiln::registry::{HttpRegistry, Registry};
use kiln::vcs::Vcs;
use kiln_registry_client::Token;

pub async fn open_registry(opts: &EngineOptions, project: &str) -> Result<Registry> {
    match opts.registry_target() {
        RegistryTarget::Local(dir) => {
            let db_path = dir.join(format!("{project}-stages.sqlite3"));
            Ok(Registry::Local(LocalRegistry::open(db_path)?))
        }
        RegistryTarget::Http(url) => {
            let token = opts
                .stages_storage_token
                .clone()
                .ok_or_else(|| eyre!("--stages-storage-token is required when --stages-storage is a URL"))?
                .parse::<Token>()?;
            Ok(Registry::Http(HttpRegistry::new(url, token)?))
        }
    }
}

/// Discover the project's VCS optimistically: a missing or unusable
/// repository degrades the resolver and cleanup engine to their
/// VCS-unavailable behavior rather than failing the whole run (history-based
/// cleanup and git-backed stages do still need one — those commands surface
/// their own errors downstream when `None` turns out not to be good enough).
pub fn open_vcs(opts: &EngineOptions) -> Option<Vcs> {
    match Vcs::discover(&opts.dir) {
        Ok(vcs) => Some(vcs),
        Err(err) => {
            warn!(error = %err, "no usable VCS checkout found; proceeding without one");
            None
        }
    }
}

pub async fn open_cluster(opts: &EngineOptions) -> Result<Option<InUseCollector>> {
    if opts.without_kube {
        return Ok(None);
    }
    let collector = InUseCollector::connect(
        opts.kube_config.as_ref().and_then(|p| p.to_str()),
        opts.kube_context.as_deref(),
    )
    .await?;
    Ok(Some(collector))
}

/// `--check-all-namespaces` collapses to "every namespace visible to the
/// client" (the conservative direction for a whitelist collector: scanning
/// wider only retains more artifacts, never fewer). Otherwise the namespaces
/// explicitly passed on the command line scope the scan.
pub fn resolve_namespaces(check_all_namespaces: bool, explicit: &[String]) -> Vec<String> {
    if check_all_namespaces {
        Vec::new()
    } else {
        explicit.to_vec()
    }
}
