//! Git-history-based cleanup retains only artifacts whose backing commit is
//! still reachable from a currently-kept ref. A tag that's since been
//! deleted stops being scanned, so the artifact tied to commits that were
//! only reachable through it gets removed — even though the commit object
//! itself may still physically exist until the repository is GC'd.

use std::process::Command;

use jiff::Timestamp;
use kiln::cleanup::{CleanupEngine, KeepPolicy, LegacyPolicyConfig};
use kiln::config::CleanupMode;
use kiln::metadata::ImageMetadataStore;
use kiln::vcs::{RefKind, ScanRef, Vcs};
use kiln_registry_client::registry::{construct_name, label_keys, ArtifactDescriptor, Fingerprint, Labels, TagStrategy, UniqueId};
use tempfile::TempDir;

use crate::support::fresh_local_registry;

fn git(dir: &std::path::Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(output.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

/// Same as `git`, but with both the author and committer date pinned, so a
/// commit can be made to look older than it actually is.
fn git_commit_dated(dir: &std::path::Path, message: &str, iso_date: &str) {
    let status = Command::new("git")
        .args(["commit", "--quiet", "-m", message])
        .env("GIT_AUTHOR_DATE", iso_date)
        .env("GIT_COMMITTER_DATE", iso_date)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success());
}

/// `main` with one commit, plus a second commit on a side branch that
/// branches off `main` but is never merged back. The side branch's tag is
/// deleted before cleanup runs, mirroring "the release that shipped this
/// artifact is gone."
fn repo_with_an_orphaned_branch() -> (TempDir, String, String) {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "--quiet", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    git(dir.path(), &["config", "user.name", "test"]);

    std::fs::write(dir.path().join("a.txt"), "on main").unwrap();
    git(dir.path(), &["add", "a.txt"]);
    git(dir.path(), &["commit", "--quiet", "-m", "main commit"]);
    let main_commit = git(dir.path(), &["rev-parse", "HEAD"]);

    git(dir.path(), &["checkout", "--quiet", "-b", "feature-old"]);
    std::fs::write(dir.path().join("b.txt"), "on feature").unwrap();
    git(dir.path(), &["add", "b.txt"]);
    git(dir.path(), &["commit", "--quiet", "-m", "feature commit"]);
    let feature_commit = git(dir.path(), &["rev-parse", "HEAD"]);
    git(dir.path(), &["tag", "v-feature"]);

    git(dir.path(), &["checkout", "--quiet", "main"]);
    git(dir.path(), &["branch", "-D", "feature-old"]);
    git(dir.path(), &["tag", "-d", "v-feature"]);

    (dir, main_commit, feature_commit)
}

fn publish(
    project: &str,
    registry: &kiln::registry::Registry,
    fingerprint: &Fingerprint,
) -> ArtifactDescriptor {
    let name = construct_name(&format!("{project}-stages"), fingerprint, UniqueId::new(1));
    let mut labels = Labels::new();
    labels.insert(label_keys::STAGE_SIGNATURE, fingerprint.to_hex());
    labels.insert(label_keys::IMAGE_TAG, "app");
    labels.insert(label_keys::TAG_STRATEGY, TagStrategy::GitTag.to_string());
    ArtifactDescriptor::builder()
        .name(name.clone())
        .repository(format!("{project}-stages"))
        .tag(name.rsplit_once(':').map(|(_, t)| t.to_string()).unwrap_or_default())
        .id(format!("sha256:{}", fingerprint.to_hex()))
        .size_bytes(1)
        .created_at(Timestamp::now())
        .labels(labels)
        .build()
}

#[tokio::test]
async fn history_based_cleanup_drops_artifacts_whose_ref_was_deleted() {
    let (repo_dir, main_commit, feature_commit) = repo_with_an_orphaned_branch();
    let vcs = Vcs::discover(repo_dir.path()).unwrap();

    let (_dir, registry) = fresh_local_registry();
    let metadata = ImageMetadataStore::new(registry.clone());

    let fp_main = Fingerprint::from_fields([b"main-stage" as &[u8]]);
    let fp_feature = Fingerprint::from_fields([b"feature-stage" as &[u8]]);

    metadata.put("demo", "app", &main_commit, fp_main.clone()).await.unwrap();
    metadata.put("demo", "app", &feature_commit, fp_feature.clone()).await.unwrap();

    let main_artifact = publish("demo", &registry, &fp_main);
    let feature_artifact = publish("demo", &registry, &fp_feature);
    registry.publish("demo", main_artifact.clone()).await.unwrap();
    registry.publish("demo", feature_artifact.clone()).await.unwrap();

    let engine = CleanupEngine::new("demo", registry.clone(), metadata, Some(vcs), None, false);

    // Only `main` is still a ref worth keeping — `v-feature` was deleted
    // before cleanup ran, so it's simply not in this run's keep-policy list.
    let keep_policies = vec![KeepPolicy { scan_ref: ScanRef { name: "main".into(), kind: RefKind::Branch }, limit: None, expiry: None }];

    let report = engine
        .cleanup(CleanupMode::HistoryBased { v1_2: true }, &LegacyPolicyConfig::default(), &keep_policies, &[])
        .await
        .unwrap();

    assert_eq!(report.deleted.iter().map(|a| &a.name).collect::<Vec<_>>(), vec![&feature_artifact.name]);
    assert_eq!(report.retained.iter().map(|a| &a.name).collect::<Vec<_>>(), vec![&main_artifact.name]);

    assert!(registry.get_commit_metadata("demo", "app", &feature_commit).await.unwrap().is_none());
    assert!(registry.get_commit_metadata("demo", "app", &main_commit).await.unwrap().is_some());
}

/// An artifact whose fingerprint has no extant commit at all (its metadata
/// record was purged, or never existed) is warned about and retained rather
/// than deleted, as long as the v1.2 backward-compatibility toggle is off —
/// and retention must survive the reachability filter later in the pass,
/// since an artifact with no extant commit can never be `reached`.
#[tokio::test]
async fn no_extant_commit_artifact_is_retained_with_v1_2_off() {
    let (repo_dir, main_commit, _feature_commit) = repo_with_an_orphaned_branch();
    let vcs = Vcs::discover(repo_dir.path()).unwrap();

    let (_dir, registry) = fresh_local_registry();
    let metadata = ImageMetadataStore::new(registry.clone());

    let fp_main = Fingerprint::from_fields([b"main-stage" as &[u8]]);
    let fp_orphaned = Fingerprint::from_fields([b"no-commit-stage" as &[u8]]);

    metadata.put("demo", "app", &main_commit, fp_main.clone()).await.unwrap();

    let main_artifact = publish("demo", &registry, &fp_main);
    let orphaned_artifact = publish("demo", &registry, &fp_orphaned);
    registry.publish("demo", main_artifact.clone()).await.unwrap();
    registry.publish("demo", orphaned_artifact.clone()).await.unwrap();

    let engine = CleanupEngine::new("demo", registry.clone(), metadata, Some(vcs), None, false);
    let keep_policies = vec![KeepPolicy { scan_ref: ScanRef { name: "main".into(), kind: RefKind::Branch }, limit: None, expiry: None }];

    let report = engine
        .cleanup(CleanupMode::HistoryBased { v1_2: false }, &LegacyPolicyConfig::default(), &keep_policies, &[])
        .await
        .unwrap();

    assert!(report.deleted.is_empty(), "nothing should be deleted when v1.2 is off");
    assert_eq!(report.warned.iter().map(|a| &a.name).collect::<Vec<_>>(), vec![&orphaned_artifact.name]);
    let retained_names: Vec<_> = report.retained.iter().map(|a| &a.name).collect();
    assert!(retained_names.contains(&&main_artifact.name));
    assert!(retained_names.contains(&&orphaned_artifact.name));
}

/// `main` with an old first commit and a recent second commit, both with
/// image-metadata records. A keep-policy expiry shorter than the gap
/// between them must stop the walk before it reaches the old commit, so
/// the artifact backing it is deleted even though the commit itself still
/// exists in history.
fn repo_with_an_old_and_a_recent_commit() -> (TempDir, String, String) {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "--quiet", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    git(dir.path(), &["config", "user.name", "test"]);

    std::fs::write(dir.path().join("a.txt"), "old").unwrap();
    git(dir.path(), &["add", "a.txt"]);
    git_commit_dated(dir.path(), "old commit", "2000-01-01T00:00:00+0000");
    let old_commit = git(dir.path(), &["rev-parse", "HEAD"]);

    std::fs::write(dir.path().join("b.txt"), "recent").unwrap();
    git(dir.path(), &["add", "b.txt"]);
    git(dir.path(), &["commit", "--quiet", "-m", "recent commit"]);
    let recent_commit = git(dir.path(), &["rev-parse", "HEAD"]);

    (dir, old_commit, recent_commit)
}

#[tokio::test]
async fn keep_policy_expiry_stops_the_walk_before_an_old_commit() {
    let (repo_dir, old_commit, recent_commit) = repo_with_an_old_and_a_recent_commit();
    let vcs = Vcs::discover(repo_dir.path()).unwrap();

    let (_dir, registry) = fresh_local_registry();
    let metadata = ImageMetadataStore::new(registry.clone());

    let fp_old = Fingerprint::from_fields([b"old-stage" as &[u8]]);
    let fp_recent = Fingerprint::from_fields([b"recent-stage" as &[u8]]);

    metadata.put("demo", "app", &old_commit, fp_old.clone()).await.unwrap();
    metadata.put("demo", "app", &recent_commit, fp_recent.clone()).await.unwrap();

    let old_artifact = publish("demo", &registry, &fp_old);
    let recent_artifact = publish("demo", &registry, &fp_recent);
    registry.publish("demo", old_artifact.clone()).await.unwrap();
    registry.publish("demo", recent_artifact.clone()).await.unwrap();

    let engine = CleanupEngine::new("demo", registry.clone(), metadata, Some(vcs), None, false);
    let keep_policies = vec![KeepPolicy {
        scan_ref: ScanRef { name: "main".into(), kind: RefKind::Branch },
        limit: None,
        expiry: Some(std::time::Duration::from_secs(30 * 24 * 60 * 60)),
    }];

    let report = engine
        .cleanup(CleanupMode::HistoryBased { v1_2: true }, &LegacyPolicyConfig::default(), &keep_policies, &[])
        .await
        .unwrap();

    assert_eq!(report.deleted.iter().map(|a| &a.name).collect::<Vec<_>>(), vec![&old_artifact.name]);
    assert_eq!(report.retained.iter().map(|a| &a.name).collect::<Vec<_>>(), vec![&recent_artifact.name]);
}
