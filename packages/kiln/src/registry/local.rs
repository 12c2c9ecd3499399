//! The default, local-only stage registry: SQLite for the ledger, no
//! network round trips. Grounded the same way the teacher's
//! `cache/local/metadata.rs` grounds its local cache: a `rusqlite::Connection`
//! opened once, wrapped so synchronous calls can run from async call sites.

use std::path::Path;
use std::sync::{Arc, Mutex};

use color_eyre::{Result, eyre::Context};
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::instrument;

use kiln_registry_client::registry::{ArtifactDescriptor, CommitRecord, Fingerprint, Labels};

/// SQLite-backed stage registry and image-metadata store.
///
/// A single connection guarded by a blocking mutex; every public method
/// ships its work to `spawn_blocking` so the async call sites elsewhere in
/// the engine never block the executor on SQLite's synchronous API.
#[derive(Clone, derive_more::Debug)]
pub struct LocalRegistry {
    #[debug("<connection>")]
    conn: Arc<Mutex<Connection>>,
}

impl LocalRegistry {
    #[instrument(name = "LocalRegistry::open", skip(path))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create registry directory {parent:?}"))?;
        }
        let conn = Connection::open(path).with_context(|| format!("open registry database at {path:?}"))?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory registry")?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("registry connection poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                name TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                unique_id INTEGER NOT NULL,
                repository TEXT NOT NULL,
                tag TEXT NOT NULL,
                artifact_id TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                labels TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_fingerprint
                ON artifacts(project, fingerprint);

            CREATE TABLE IF NOT EXISTS managed_images (
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (project, name)
            );

            CREATE TABLE IF NOT EXISTS commit_metadata (
                project TEXT NOT NULL,
                image TEXT NOT NULL,
                commit_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                PRIMARY KEY (project, image, commit_id)
            );
            "#,
        )
        .context("initialize registry schema")
    }

    #[instrument(skip(self, artifact))]
    pub async fn publish(&self, project: &str, artifact: ArtifactDescriptor) -> Result<ArtifactDescriptor> {
        let conn = self.conn.clone();
        let project = project.to_string();
        tokio::task::spawn_blocking(move || -> Result<ArtifactDescriptor> {
            let conn = conn.lock().expect("registry connection poisoned");
            let fingerprint = artifact.fingerprint()?.to_hex();
            let unique_id = artifact
                .name
                .rsplit_once('-')
                .and_then(|(_, id)| id.parse::<u64>().ok())
                .unwrap_or_default();
            let labels = serde_json::to_string(&artifact.labels).context("serialize labels")?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO artifacts
                (name, project, fingerprint, unique_id, repository, tag, artifact_id, size_bytes, created_at, labels)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    artifact.name,
                    project,
                    fingerprint,
                    unique_id as i64,
                    artifact.repository,
                    artifact.tag,
                    artifact.id,
                    artifact.size_bytes as i64,
                    artifact.created_at.to_string(),
                    labels,
                ],
            )
            .context("insert artifact")?;
            Ok(artifact)
        })
        .await
        .context("join publish task")?
    }

    #[instrument(skip(self))]
    pub async fn list_by_fingerprint(
        &self,
        project: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<ArtifactDescriptor>> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let fingerprint = fingerprint.to_hex();
        tokio::task::spawn_blocking(move || -> Result<Vec<ArtifactDescriptor>> {
            let conn = conn.lock().expect("registry connection poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT name, repository, tag, artifact_id, size_bytes, created_at, labels
                     FROM artifacts WHERE project = ?1 AND fingerprint = ?2",
                )
                .context("prepare list-by-fingerprint query")?;
            let rows = stmt
                .query_map(params![project, fingerprint], row_to_descriptor)
                .context("execute list-by-fingerprint query")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("read list-by-fingerprint rows")
        })
        .await
        .context("join list-by-fingerprint task")?
    }

    /// Every artifact published under the project, regardless of
    /// fingerprint (the cleanup engine's starting candidate set, §4.J).
    #[instrument(skip(self))]
    pub async fn list_all(&self, project: &str) -> Result<Vec<ArtifactDescriptor>> {
        let conn = self.conn.clone();
        let project = project.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<ArtifactDescriptor>> {
            let conn = conn.lock().expect("registry connection poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT name, repository, tag, artifact_id, size_bytes, created_at, labels
                     FROM artifacts WHERE project = ?1",
                )
                .context("prepare list-all query")?;
            let rows = stmt
                .query_map(params![project], row_to_descriptor)
                .context("execute list-all query")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("read list-all rows")
        })
        .await
        .context("join list-all task")?
    }

    #[instrument(skip(self))]
    pub async fn get(&self, project: &str, name: &str) -> Result<Option<ArtifactDescriptor>> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ArtifactDescriptor>> {
            let conn = conn.lock().expect("registry connection poisoned");
            conn.query_row(
                "SELECT name, repository, tag, artifact_id, size_bytes, created_at, labels
                 FROM artifacts WHERE project = ?1 AND name = ?2",
                params![project, name],
                row_to_descriptor,
            )
            .optional()
            .context("query artifact by name")
        })
        .await
        .context("join get task")?
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, project: &str, name: &str) -> Result<()> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock().expect("registry connection poisoned");
            conn.execute(
                "DELETE FROM artifacts WHERE project = ?1 AND name = ?2",
                params![project, name],
            )
            .context("delete artifact")?;
            Ok(())
        })
        .await
        .context("join delete task")?
    }

    #[instrument(skip(self))]
    pub async fn list_managed_images(&self, project: &str) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        let project = project.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = conn.lock().expect("registry connection poisoned");
            let mut stmt = conn
                .prepare("SELECT name FROM managed_images WHERE project = ?1")
                .context("prepare list-managed-images query")?;
            let rows = stmt
                .query_map(params![project], |row| row.get::<_, String>(0))
                .context("execute list-managed-images query")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("read list-managed-images rows")
        })
        .await
        .context("join list-managed-images task")?
    }

    #[instrument(skip(self))]
    pub async fn add_managed_image(&self, project: &str, name: &str) -> Result<()> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock().expect("registry connection poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO managed_images (project, name) VALUES (?1, ?2)",
                params![project, name],
            )
            .context("insert managed image")?;
            Ok(())
        })
        .await
        .context("join add-managed-image task")?
    }

    #[instrument(skip(self))]
    pub async fn list_commits(&self, project: &str, image: &str) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let image = image.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = conn.lock().expect("registry connection poisoned");
            let mut stmt = conn
                .prepare("SELECT commit_id FROM commit_metadata WHERE project = ?1 AND image = ?2")
                .context("prepare list-commits query")?;
            let rows = stmt
                .query_map(params![project, image], |row| row.get::<_, String>(0))
                .context("execute list-commits query")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("read list-commits rows")
        })
        .await
        .context("join list-commits task")?
    }

    #[instrument(skip(self))]
    pub async fn get_commit_metadata(
        &self,
        project: &str,
        image: &str,
        commit: &str,
    ) -> Result<Option<CommitRecord>> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let image_owned = image.to_string();
        let commit_owned = commit.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CommitRecord>> {
            let conn = conn.lock().expect("registry connection poisoned");
            conn.query_row(
                "SELECT image, commit_id, fingerprint FROM commit_metadata
                 WHERE project = ?1 AND image = ?2 AND commit_id = ?3",
                params![project, image_owned, commit_owned],
                row_to_commit_record,
            )
            .optional()
            .context("query commit metadata")?
            .transpose()
        })
        .await
        .context("join get-commit-metadata task")?
    }

    #[instrument(skip(self))]
    pub async fn put_commit_metadata(&self, project: &str, record: &CommitRecord) -> Result<()> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock().expect("registry connection poisoned");
            conn.execute(
                "INSERT OR REPLACE INTO commit_metadata (project, image, commit_id, fingerprint)
                 VALUES (?1, ?2, ?3, ?4)",
                params![project, record.image, record.commit, record.fingerprint.to_hex()],
            )
            .context("insert commit metadata")?;
            Ok(())
        })
        .await
        .context("join put-commit-metadata task")?
    }

    #[instrument(skip(self))]
    pub async fn remove_commit_metadata(&self, project: &str, image: &str, commit: &str) -> Result<()> {
        let conn = self.conn.clone();
        let project = project.to_string();
        let image = image.to_string();
        let commit = commit.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock().expect("registry connection poisoned");
            conn.execute(
                "DELETE FROM commit_metadata WHERE project = ?1 AND image = ?2 AND commit_id = ?3",
                params![project, image, commit],
            )
            .context("delete commit metadata")?;
            Ok(())
        })
        .await
        .context("join remove-commit-metadata task")?
    }
}

fn row_to_descriptor(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactDescriptor> {
    let name: String = row.get(0)?;
    let repository: String = row.get(1)?;
    let tag: String = row.get(2)?;
    let artifact_id: String = row.get(3)?;
    let size_bytes: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    let labels: String = row.get(6)?;
    let created_at: Timestamp = created_at.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, "bad timestamp".into())
    })?;
    let labels: Labels = serde_json::from_str(&labels).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, "bad labels".into())
    })?;
    Ok(ArtifactDescriptor::builder()
        .name(name)
        .repository(repository)
        .tag(tag)
        .id(artifact_id)
        .size_bytes(size_bytes as u64)
        .created_at(created_at)
        .labels(labels)
        .build())
}

fn row_to_commit_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<CommitRecord>> {
    let image: String = row.get(0)?;
    let commit: String = row.get(1)?;
    let fingerprint: String = row.get(2)?;
    Ok(Fingerprint::from_hex(&fingerprint)
        .map(|fingerprint| CommitRecord { image, commit, fingerprint }))
}
