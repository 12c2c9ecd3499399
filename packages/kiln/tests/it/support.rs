//! Shared fixtures for the end-to-end scenarios.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use color_eyre::Result;
use kiln::container::{BuildSpec, BuiltImage, ContainerEngine};
use kiln::registry::local::LocalRegistry;
use kiln::registry::Registry;

/// A container engine that needs no Docker daemon: the built image id is a
/// deterministic hash of the spec's base image and commands, so two builds
/// with identical inputs always produce identical artifacts (the property
/// the at-most-one-winner race resolution depends on) and two builds with
/// different inputs never collide.
#[derive(Clone, Default)]
pub struct CountingEngine {
    calls: Arc<AtomicU64>,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContainerEngine for CountingEngine {
    async fn build(&self, spec: &BuildSpec) -> Result<BuiltImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hasher = DefaultHasher::new();
        spec.base_image.hash(&mut hasher);
        spec.commands.hash(&mut hasher);
        let id = format!("sha256:{:x}", hasher.finish());
        let size_bytes = spec.commands.iter().map(|c| c.len() as u64).sum::<u64>() + 1;
        Ok(BuiltImage { id, size_bytes })
    }
}

/// A fresh file-backed local registry. `LocalRegistry::in_memory` exists
/// only for the library's own unit tests (`#[cfg(test)]`); from here, a
/// throwaway SQLite file under a temp directory is the equivalent — and
/// matches what `wiring::open_registry` actually does in the binary.
pub fn fresh_local_registry() -> (tempfile::TempDir, Registry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::Local(LocalRegistry::open(dir.path().join("stages.sqlite3")).unwrap());
    (dir, registry)
}
