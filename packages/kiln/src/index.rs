//! Component C: the fast index.
//!
//! An advisory, per-fingerprint accelerator over the stage registry. Every
//! entry may be dropped without loss of correctness — only of speed — so
//! it's modeled as a plain in-memory cache behind a `tokio::sync::RwLock`
//! rather than anything durable. Callers always re-confirm a hit against
//! the registry before acting on it (§4.C); this type never needs to be
//! "correct", only fast when it happens to be right.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;

use kiln_registry_client::registry::{ArtifactDescriptor, Fingerprint};

#[derive(Clone, Default)]
pub struct FastIndex {
    entries: Arc<RwLock<HashMap<(String, String), Vec<ArtifactDescriptor>>>>,
}

impl FastIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self))]
    pub async fn get(&self, project: &str, fingerprint: &Fingerprint) -> Option<Vec<ArtifactDescriptor>> {
        let key = (project.to_string(), fingerprint.to_hex());
        self.entries.read().await.get(&key).cloned()
    }

    #[instrument(skip(self, descriptors))]
    pub async fn put(&self, project: &str, fingerprint: &Fingerprint, descriptors: Vec<ArtifactDescriptor>) {
        let key = (project.to_string(), fingerprint.to_hex());
        self.entries.write().await.insert(key, descriptors);
    }

    /// Drop a single entry, simulating index corruption (used in tests to
    /// exercise the resolver's reset path, §8 scenario 3).
    #[cfg(test)]
    pub async fn evict(&self, project: &str, fingerprint: &Fingerprint) {
        let key = (project.to_string(), fingerprint.to_hex());
        self.entries.write().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::Timestamp;
    use kiln_registry_client::registry::Labels;

    fn descriptor(name: &str) -> ArtifactDescriptor {
        ArtifactDescriptor::builder()
            .name(name.to_string())
            .repository("demo-stages".to_string())
            .tag("fp-1".to_string())
            .id("sha256:abc".to_string())
            .size_bytes(1)
            .created_at(Timestamp::from_second(1).unwrap())
            .labels(Labels::new())
            .build()
    }

    #[tokio::test]
    async fn miss_then_hit_then_evict() {
        let index = FastIndex::new();
        let fp = Fingerprint::from_fields([b"install" as &[u8]]);
        assert!(index.get("demo", &fp).await.is_none());

        index.put("demo", &fp, vec![descriptor("demo-stages:fp-1")]).await;
        assert_eq!(index.get("demo", &fp).await.unwrap().len(), 1);

        index.evict("demo", &fp).await;
        assert!(index.get("demo", &fp).await.is_none());
    }

    #[tokio::test]
    async fn entries_are_scoped_per_project() {
        let index = FastIndex::new();
        let fp = Fingerprint::from_fields([b"install" as &[u8]]);
        index.put("a", &fp, vec![descriptor("a-stages:fp-1")]).await;
        assert!(index.get("b", &fp).await.is_none());
    }
}
