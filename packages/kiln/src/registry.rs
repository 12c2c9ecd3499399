//! Component B: the stage registry.
//!
//! Two backends share one surface: [`Registry::Local`], the default,
//! SQLite-backed store with no network dependency, and [`Registry::Http`],
//! a thin wrapper over [`kiln_registry_client::registry::RegistryClient`].
//! Fingerprint is the primary discriminator; unique-id disambiguates
//! multiple artifacts published under the same fingerprint (a race between
//! concurrent builders, §4.B).

pub mod local;

use color_eyre::Result;
use url::Url;

use kiln_registry_client::Token;
use kiln_registry_client::registry::{
    ArtifactDescriptor, CommitRecord, Fingerprint, RegistryClient, UniqueId, construct_name,
    parse_repository_and_tag,
};

pub use local::LocalRegistry;

/// The stages repository name for a project, e.g. `"demo-stages"`. Shared
/// by both backends so `construct_name` produces identical results
/// regardless of which one is in use.
pub fn stages_repository(project: &str) -> String {
    format!("{project}-stages")
}

#[derive(Clone)]
pub enum Registry {
    Local(LocalRegistry),
    Http(HttpRegistry),
}

#[derive(Clone)]
pub struct HttpRegistry {
    client: RegistryClient,
}

impl HttpRegistry {
    pub fn new(base_url: Url, token: Token) -> Result<Self> {
        Ok(Self {
            client: RegistryClient::new(base_url, token)?,
        })
    }
}

impl Registry {
    /// Deterministic, injective over `(project, fingerprint, unique-id)`
    /// (§4.B).
    pub fn construct_name(&self, project: &str, fingerprint: &Fingerprint, unique_id: UniqueId) -> String {
        construct_name(&stages_repository(project), fingerprint, unique_id)
    }

    pub async fn publish(&self, project: &str, artifact: ArtifactDescriptor) -> Result<ArtifactDescriptor> {
        match self {
            Self::Local(local) => local.publish(project, artifact).await,
            Self::Http(http) => {
                let (repository, fingerprint, _) = parse_repository_and_tag(&artifact.name)?;
                let _ = fingerprint;
                http.client
                    .publish(
                        project,
                        &repository,
                        &artifact.tag,
                        artifact.size_bytes,
                        &artifact.labels,
                    )
                    .await
            }
        }
    }

    pub async fn list_by_fingerprint(
        &self,
        project: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<ArtifactDescriptor>> {
        match self {
            Self::Local(local) => local.list_by_fingerprint(project, fingerprint).await,
            Self::Http(http) => http.client.list_by_fingerprint(project, fingerprint).await,
        }
    }

    pub async fn get(
        &self,
        project: &str,
        fingerprint: &Fingerprint,
        unique_id: UniqueId,
    ) -> Result<Option<ArtifactDescriptor>> {
        let name = self.construct_name(project, fingerprint, unique_id);
        match self {
            Self::Local(local) => local.get(project, &name).await,
            Self::Http(http) => http.client.get(project, &name).await,
        }
    }

    pub async fn delete(&self, project: &str, artifact: &ArtifactDescriptor) -> Result<()> {
        match self {
            Self::Local(local) => local.delete(project, &artifact.name).await,
            Self::Http(http) => http.client.delete(project, &artifact.name).await,
        }
    }

    /// Every artifact published under the project, regardless of
    /// fingerprint: the cleanup engine's starting candidate set (§4.J).
    pub async fn list_managed_artifacts(&self, project: &str) -> Result<Vec<ArtifactDescriptor>> {
        match self {
            Self::Local(local) => local.list_all(project).await,
            Self::Http(http) => http.client.list_all(project).await,
        }
    }

    pub async fn list_managed_images(&self, project: &str) -> Result<Vec<String>> {
        match self {
            Self::Local(local) => local.list_managed_images(project).await,
            Self::Http(http) => http
                .client
                .list_managed_images(project)
                .await
                .map(|descriptors| descriptors.into_iter().map(|d| d.name).collect()),
        }
    }

    pub async fn add_managed_image(&self, project: &str, name: &str) -> Result<()> {
        match self {
            Self::Local(local) => local.add_managed_image(project, name).await,
            Self::Http(http) => http.client.add_managed_image(project, name).await,
        }
    }

    pub async fn list_commits(&self, project: &str, image: &str) -> Result<Vec<String>> {
        match self {
            Self::Local(local) => local.list_commits(project, image).await,
            Self::Http(http) => http.client.list_commits(project, image).await,
        }
    }

    pub async fn get_commit_metadata(
        &self,
        project: &str,
        image: &str,
        commit: &str,
    ) -> Result<Option<CommitRecord>> {
        match self {
            Self::Local(local) => local.get_commit_metadata(project, image, commit).await,
            Self::Http(http) => http.client.get_commit_metadata(project, image, commit).await,
        }
    }

    pub async fn put_commit_metadata(&self, project: &str, record: &CommitRecord) -> Result<()> {
        match self {
            Self::Local(local) => local.put_commit_metadata(project, record).await,
            Self::Http(http) => http.client.put_commit_metadata(project, record).await,
        }
    }

    pub async fn remove_commit_metadata(&self, project: &str, image: &str, commit: &str) -> Result<()> {
        match self {
            Self::Local(local) => local.remove_commit_metadata(project, image, commit).await,
            Self::Http(http) => http.client.remove_commit_metadata(project, image, commit).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_repository_name_is_project_scoped() {
        assert_eq!(stages_repository("demo"), "demo-stages");
    }

    #[tokio::test]
    async fn construct_name_matches_local_and_http_conventions() {
        let registry = Registry::Local(LocalRegistry::in_memory().unwrap());
        let fp = Fingerprint::from_fields([b"install" as &[u8]]);
        let name = registry.construct_name("demo", &fp, UniqueId::new(1));
        assert_eq!(name, format!("demo-stages:{}-1", fp.to_hex()));
    }
}
