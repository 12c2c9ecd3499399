//! Component E: the image metadata store.
//!
//! A thin, named façade over the registry's commit-metadata operations
//! (§6: "image-metadata records live in the registry itself under a
//! reserved tag namespace"). Kept as its own component per the
//! specification even though it shares a backend with B, since the two
//! have distinct responsibilities: B owns artifacts, E owns the
//! `(image, commit) -> fingerprint` correlation the history-based cleanup
//! pass walks.

use color_eyre::Result;

use kiln_registry_client::registry::{CommitRecord, Fingerprint};

use crate::registry::Registry;

#[derive(Clone)]
pub struct ImageMetadataStore {
    registry: Registry,
}

impl ImageMetadataStore {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub async fn list_commits(&self, project: &str, image: &str) -> Result<Vec<String>> {
        self.registry.list_commits(project, image).await
    }

    pub async fn get(&self, project: &str, image: &str, commit: &str) -> Result<Option<CommitRecord>> {
        self.registry.get_commit_metadata(project, image, commit).await
    }

    /// Idempotent: recording the same `(image, commit)` twice with the same
    /// fingerprint is a no-op; with a different fingerprint, the record is
    /// overwritten (there is no transactional guarantee across pairs, §4.E).
    pub async fn put(&self, project: &str, image: &str, commit: &str, fingerprint: Fingerprint) -> Result<()> {
        let record = CommitRecord {
            image: image.to_string(),
            commit: commit.to_string(),
            fingerprint,
        };
        self.registry.put_commit_metadata(project, &record).await
    }

    pub async fn remove(&self, project: &str, image: &str, commit: &str) -> Result<()> {
        self.registry.remove_commit_metadata(project, image, commit).await
    }
}
