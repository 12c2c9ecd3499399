//! Project configuration and engine-wide run options.
//!
//! Per the specification's non-goals, the configuration *schema* is assumed
//! given — in a full repository it would be loaded and templated by an
//! external collaborator. What lives here is the already-parsed shape the
//! rest of the engine consumes, plus [`EngineOptions`], the explicit context
//! every entry point takes instead of reading process-wide globals (design
//! note in §9 of the specification: "a reimplementation should pass an
//! explicit `Engine` context into every entry point").

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

/// A project's declared pipeline of images.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project: String,
    pub images: Vec<ImageConfig>,
}

impl ProjectConfig {
    pub fn image(&self, name: &str) -> Option<&ImageConfig> {
        self.images.iter().find(|i| i.name == name)
    }

    /// Load a project's pipeline declaration from `<dir>/kiln.toml`.
    ///
    /// The specification leaves configuration file loading and templating
    /// to an external collaborator (§1's non-goals); this is the minimal
    /// boundary the `kiln` binary needs to get an already-parsed
    /// [`ProjectConfig`] in hand, not a reimplementation of that
    /// collaborator's templating engine.
    pub fn load(dir: impl AsRef<std::path::Path>) -> color_eyre::Result<Self> {
        use color_eyre::eyre::Context;

        let path = dir.as_ref().join("kiln.toml");
        let raw = std::fs::read_to_string(&path).with_context(|| format!("read project config at {path:?}"))?;
        toml::from_str(&raw).with_context(|| format!("parse project config at {path:?}"))
    }
}

/// Where an image's base layer comes from: a literal registry reference, or
/// another image managed by the same project (establishing the inter-image
/// `from` dependency the conveyor orders its run by).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum FromRef {
    BaseImage(String),
    Image(String),
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    pub from: FromRef,
    pub stages: Vec<StageConfig>,
}

/// A mount declared by a stage: a tmp-dir mount, a build-dir mount, or a
/// custom source-relative mount (the custom case is what
/// `Labels::custom_mount_dir_key` encodes on the published artifact).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Mount {
    Tmp { path: String },
    Build { path: String },
    Custom { source_alias: String, path: String },
}

/// Shell commands run during a `beforeInstall|install|beforeSetup|setup`
/// stage, plus the mounts and labels it contributes to its dependency digest.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ShellStageConfig {
    pub commands: Vec<String>,
    pub mounts: Vec<Mount>,
    pub labels: std::collections::BTreeMap<String, String>,
}

/// An import step: copy artifacts from another managed image's final layer.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ImportConfig {
    pub from_image: String,
    pub add: String,
    pub to: String,
}

/// A single repository checked out by a `gitArchive|gitCache|gitLatestPatch`
/// stage, mapped to the commit id the stage last pinned (if any —
/// unresolved at config-load time, filled in by the VCS layer at
/// dependency-computation time).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct GitSource {
    pub alias: String,
    pub add: String,
    pub to: String,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct GitStageConfig {
    pub sources: Vec<GitSource>,
    pub mounts: Vec<Mount>,
}

/// Raw `docker`-style instructions appended verbatim to the in-progress
/// container-commit change set.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct DockerInstructionsConfig {
    pub instructions: Vec<String>,
}

/// The whole-file `dockerfile` variant: bypasses service-mount machinery
/// (§10.6) and is built from the Dockerfile content directly.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct DockerfileConfig {
    pub path: PathBuf,
    pub build_args: std::collections::BTreeMap<String, String>,
    pub target: Option<String>,
}

/// One declared pipeline step, in the order the image lists them.
///
/// `From` is the synthetic first stage of every image (its dependency
/// digest is the resolved base-image id, not any of the payloads below).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "variant", content = "config")]
pub enum StageConfig {
    From,
    BeforeInstall(ShellStageConfig),
    Import(ImportConfig),
    Install(ShellStageConfig),
    BeforeSetup(ShellStageConfig),
    Setup(ShellStageConfig),
    GitArchive(GitStageConfig),
    GitCache(GitStageConfig),
    GitLatestPatch(GitStageConfig),
    DockerInstructions(DockerInstructionsConfig),
    Dockerfile(DockerfileConfig),
}

impl StageConfig {
    /// The variant's string name, used verbatim as the stage's fingerprint
    /// input and its `werf-stage-signature`-adjacent label.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::From => "from",
            Self::BeforeInstall(_) => "beforeInstall",
            Self::Import(_) => "import",
            Self::Install(_) => "install",
            Self::BeforeSetup(_) => "beforeSetup",
            Self::Setup(_) => "setup",
            Self::GitArchive(_) => "gitArchive",
            Self::GitCache(_) => "gitCache",
            Self::GitLatestPatch(_) => "gitLatestPatch",
            Self::DockerInstructions(_) => "dockerInstructions",
            Self::Dockerfile(_) => "dockerfile",
        }
    }
}

/// Which cleanup discipline a `cleanup` run applies — mutually exclusive,
/// selected by CLI flags per §6.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum CleanupMode {
    #[default]
    Legacy,
    HistoryBased {
        v1_2: bool,
    },
}

/// Engine-wide run options, built from parsed CLI flags and `KILN_*`
/// environment fallbacks. Threaded explicitly into every entry point rather
/// than read from process globals (the one exception, per the design note
/// this mirrors, is the lock-file directory under `home_dir`).
#[derive(Clone, Debug, Args)]
pub struct EngineOptions {
    /// The project's working directory (containing the source tree and its
    /// VCS history).
    #[arg(long = "dir", env = "KILN_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Scratch space for in-progress builds; cleaned at process exit by the
    /// ambient temporary-directory manager.
    #[arg(long = "tmp-dir", env = "KILN_TMP_DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Home directory for per-project shared context and named locks.
    #[arg(long = "home-dir", env = "KILN_HOME_DIR")]
    pub home_dir: Option<PathBuf>,

    /// Stage registry target. A bare path selects the local SQLite-backed
    /// registry; anything parseable as a URL selects the HTTP backend.
    #[arg(long = "stages-storage", env = "KILN_STAGES_STORAGE")]
    pub stages_storage: Option<String>,

    /// Registry authentication token, required when `--stages-storage` is
    /// a URL.
    #[arg(long = "stages-storage-token", env = "KILN_STAGES_STORAGE_TOKEN")]
    pub stages_storage_token: Option<String>,

    #[arg(long = "insecure-registry", env = "KILN_INSECURE_REGISTRY")]
    pub insecure_registry: bool,

    #[arg(
        long = "skip-tls-verify-registry",
        env = "KILN_SKIP_TLS_VERIFY_REGISTRY"
    )]
    pub skip_tls_verify_registry: bool,

    /// Lock-acquisition timeout.
    #[arg(long = "synchronization", env = "KILN_SYNCHRONIZATION", value_parser = parse_duration, default_value = "30s")]
    pub synchronization_timeout: Duration,

    #[arg(long = "kube-config", env = "KILN_KUBE_CONFIG")]
    pub kube_config: Option<PathBuf>,

    #[arg(long = "kube-context", env = "KILN_KUBE_CONTEXT")]
    pub kube_context: Option<String>,

    #[arg(long = "without-kube", env = "KILN_WITHOUT_KUBE")]
    pub without_kube: bool,

    #[arg(long = "check-all-namespaces", env = "KILN_CHECK_ALL_NAMESPACES")]
    pub check_all_namespaces: bool,

    #[arg(long = "dry-run", env = "KILN_DRY_RUN")]
    pub dry_run: bool,

    #[arg(
        long = "git-history-based-cleanup",
        env = "KILN_GIT_HISTORY_BASED_CLEANUP"
    )]
    pub git_history_based_cleanup: bool,

    #[arg(
        long = "git-history-based-cleanup-v1.2",
        env = "KILN_GIT_HISTORY_BASED_CLEANUP_V1_2"
    )]
    pub git_history_based_cleanup_v1_2: bool,
}

impl EngineOptions {
    pub fn cleanup_mode(&self) -> CleanupMode {
        if self.git_history_based_cleanup || self.git_history_based_cleanup_v1_2 {
            CleanupMode::HistoryBased {
                v1_2: self.git_history_based_cleanup_v1_2,
            }
        } else {
            CleanupMode::Legacy
        }
    }

    /// Resolve the home directory: the flag/env value, or the platform
    /// default via `directories`, the one true per-process resource the
    /// design notes carve out (the lock-file directory).
    pub fn resolve_home_dir(&self) -> color_eyre::Result<PathBuf> {
        if let Some(dir) = &self.home_dir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("build", "kiln", "kiln")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| color_eyre::eyre::eyre!("could not determine a home directory for kiln"))
    }

    pub fn locks_dir(&self) -> color_eyre::Result<PathBuf> {
        Ok(self.resolve_home_dir()?.join("service").join("locks"))
    }

    pub fn project_shared_context_dir(&self, project: &str) -> color_eyre::Result<PathBuf> {
        Ok(self
            .resolve_home_dir()?
            .join("shared_context")
            .join("projects")
            .join(project))
    }

    /// `stages-storage` parsed as a registry target.
    pub fn registry_target(&self) -> RegistryTarget {
        match &self.stages_storage {
            Some(raw) => match Url::parse(raw) {
                Ok(url) => RegistryTarget::Http(url),
                Err(_) => RegistryTarget::Local(PathBuf::from(raw)),
            },
            None => RegistryTarget::Local(PathBuf::from(".")),
        }
    }
}

/// Where the stage registry lives, parsed from `--stages-storage`.
#[derive(Clone, Debug)]
pub enum RegistryTarget {
    Local(PathBuf),
    Http(Url),
}

pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, suffix) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|idx| raw.split_at(idx))
        .unwrap_or((raw, "s"));
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    match suffix {
        "s" | "" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(format!("unknown duration suffix {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn stage_variant_names_match_specification() {
        assert_eq!(StageConfig::From.variant_name(), "from");
        assert_eq!(
            StageConfig::Install(ShellStageConfig::default()).variant_name(),
            "install"
        );
        assert_eq!(
            StageConfig::Dockerfile(DockerfileConfig {
                path: PathBuf::from("Dockerfile"),
                build_args: Default::default(),
                target: None,
            })
            .variant_name(),
            "dockerfile"
        );
    }

    #[test]
    fn loads_project_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kiln.toml"),
            r#"
            project = "demo"

            [[images]]
            name = "app"

            [images.from]
            kind = "BaseImage"
            value = "alpine:3.19"

            [[images.stages]]
            variant = "install"

            [images.stages.config]
            commands = ["apk add curl"]
            mounts = []
            labels = {}
            "#,
        )
        .unwrap();

        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.project, "demo");
        assert_eq!(config.images.len(), 1);
        assert_eq!(config.images[0].name, "app");
        assert_eq!(config.images[0].stages.len(), 1);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProjectConfig::load(dir.path()).is_err());
    }
}
