//! Version control, read-only.
//!
//! Wraps `gix` the way the teacher's own git client does (open once,
//! re-resolve references per call) but trimmed to what the engine needs:
//! commit existence and ancestry checks for [`crate::stage::AncestorCheck`],
//! and tag/branch/commit enumeration for the history-based cleanup pass
//! (§4.J). No fetching or cloning — the engine always runs against a
//! working tree that is already checked out.

use std::sync::Arc;

use color_eyre::eyre::Context;
use color_eyre::Result;
use gix::ObjectId;

use crate::error::EngineError;
use crate::stage::AncestorCheck;

pub struct Vcs {
    repo: gix::Repository,
}

/// A single named reference to scan during history-based cleanup, with the
/// retention policy the keep-policy config attached to it (§4.J step 3).
#[derive(Clone, Debug)]
pub struct ScanRef {
    pub name: String,
    pub kind: RefKind,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum RefKind {
    Tag,
    Branch,
}

impl Vcs {
    pub fn discover(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let repo = gix::discover(path.as_ref())
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        Ok(Self { repo })
    }

    pub fn head_commit(&self) -> Result<String> {
        let id = self
            .repo
            .rev_parse_single("HEAD")
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        Ok(id.to_string())
    }

    /// All tag names, stripped of the `refs/tags/` prefix.
    pub fn tags(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let platform = self
            .repo
            .references()
            .context("failed to read repository references")?;
        for reference in platform.tags().context("failed to enumerate tags")?.filter_map(|r| r.ok()) {
            names.push(reference.name().shorten().to_string());
        }
        Ok(names)
    }

    /// All local branch names, stripped of the `refs/heads/` prefix.
    pub fn branches(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let platform = self
            .repo
            .references()
            .context("failed to read repository references")?;
        for reference in platform.local_branches().context("failed to enumerate branches")?.filter_map(|r| r.ok()) {
            names.push(reference.name().shorten().to_string());
        }
        Ok(names)
    }

    /// Resolve a tag or branch name to the commit id it currently points at.
    pub fn resolve_ref(&self, name: &str) -> Result<Option<String>> {
        for candidate in [
            format!("refs/tags/{name}"),
            format!("refs/heads/{name}"),
            name.to_string(),
        ] {
            if let Ok(Some(reference)) = self.repo.try_find_reference(&candidate) {
                let id = reference
                    .clone()
                    .peel_to_id_in_place()
                    .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
                return Ok(Some(id.detach().to_string()));
            }
        }
        Ok(None)
    }

    /// The commit's author timestamp, for keep-policy age cutoffs (§4.J
    /// step 4).
    pub fn commit_time(&self, commit: &str) -> Result<jiff::Timestamp> {
        let id = ObjectId::from_hex(commit.as_bytes())
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        let object = self
            .repo
            .find_object(id)
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        let commit = object
            .try_into_commit()
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        let time = commit
            .time()
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        jiff::Timestamp::from_second(time.seconds).context("commit timestamp out of range")
    }

    /// Walk a reference's first-parent-inclusive commit history, calling
    /// `visit` with each commit id, starting from its tip and stopping when
    /// `visit` returns `false` (§4.J step 4's walk-until-satisfied loop).
    pub fn walk_history(&self, start: &str, mut visit: impl FnMut(&str) -> bool) -> Result<()> {
        let id = ObjectId::from_hex(start.as_bytes())
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        let walk = self
            .repo
            .rev_walk([id])
            .all()
            .map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
        for info in walk {
            let info = info.map_err(|e| EngineError::VcsUnavailable.attach().wrap_err(e.to_string()))?;
            if !visit(&info.id.to_string()) {
                break;
            }
        }
        Ok(())
    }
}

impl AncestorCheck for Vcs {
    fn commit_exists(&self, commit: &str) -> bool {
        ObjectId::from_hex(commit.as_bytes())
            .ok()
            .and_then(|id| self.repo.find_object(id).ok())
            .is_some()
    }

    fn is_ancestor(&self, commit: &str) -> bool {
        let Some(candidate) = ObjectId::from_hex(commit.as_bytes()).ok() else {
            return false;
        };
        let Ok(head) = self.repo.rev_parse_single("HEAD") else {
            return false;
        };
        if head.detach() == candidate {
            return true;
        }
        let Ok(walk) = self.repo.rev_walk([head.detach()]).all() else {
            return false;
        };
        walk.filter_map(|info| info.ok()).any(|info| info.id == candidate)
    }
}

/// An `Arc`-backed handle to a [`Vcs`], so one discovered repository can back
/// the resolver's and the builder's independent `AncestorCheck` trait objects
/// without opening the repository twice.
#[derive(Clone)]
pub struct SharedVcs(Arc<Vcs>);

impl SharedVcs {
    pub fn new(vcs: Vcs) -> Self {
        Self(Arc::new(vcs))
    }
}

impl AncestorCheck for SharedVcs {
    fn commit_exists(&self, commit: &str) -> bool {
        self.0.commit_exists(commit)
    }

    fn is_ancestor(&self, commit: &str) -> bool {
        self.0.is_ancestor(commit)
    }
}

impl SharedVcs {
    pub fn head_commit(&self) -> Result<String> {
        self.0.head_commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo_with_one_commit() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git").args(args).current_dir(dir.path()).status().unwrap();
            assert!(status.success());
        };
        run(&["init", "--quiet"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        run(&["add", "a.txt"]);
        run(&["commit", "--quiet", "-m", "init"]);
        let out = Command::new("git").args(["rev-parse", "HEAD"]).current_dir(dir.path()).output().unwrap();
        let head = String::from_utf8(out.stdout).unwrap().trim().to_string();
        (dir, head)
    }

    #[test]
    fn head_commit_is_ancestor_of_itself() {
        let (dir, head) = init_repo_with_one_commit();
        let vcs = Vcs::discover(dir.path()).unwrap();
        assert!(vcs.commit_exists(&head));
        assert!(vcs.is_ancestor(&head));
    }

    #[test]
    fn unknown_commit_is_not_an_ancestor() {
        let (dir, _head) = init_repo_with_one_commit();
        let vcs = Vcs::discover(dir.path()).unwrap();
        assert!(!vcs.is_ancestor("0000000000000000000000000000000000000000"));
        assert!(!vcs.commit_exists("0000000000000000000000000000000000000000"));
    }

    #[test]
    fn walk_history_visits_head_first() {
        let (dir, head) = init_repo_with_one_commit();
        let vcs = Vcs::discover(dir.path()).unwrap();
        let mut visited = Vec::new();
        vcs.walk_history(&head, |commit| {
            visited.push(commit.to_string());
            true
        })
        .unwrap();
        assert_eq!(visited, vec![head]);
    }
}
