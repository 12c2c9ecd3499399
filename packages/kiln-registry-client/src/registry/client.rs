//! HTTP client for the stage registry API.

use color_eyre::{
    Section, SectionExt,
    eyre::{Context, eyre},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::Token;

use super::{ArtifactDescriptor, CommitRecord, Fingerprint};

/// A client for the stage registry's HTTP API.
///
/// Mirrors the shape of the engine's other backend clients: a base URL, a
/// bearer token, and a `reqwest::Client` reused across requests. Errors are
/// enriched with response bodies and request ids via `color_eyre`'s
/// `Section` so a failed request is debuggable from the top-level error
/// report alone.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    base_url: Url,
    token: Token,
    http: reqwest::Client,
}

/// Request body for publishing a new artifact.
#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    repository: &'a str,
    tag: &'a str,
    size_bytes: u64,
    labels: &'a super::Labels,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl RegistryClient {
    pub fn new(base_url: Url, token: Token) -> color_eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            base_url,
            token,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> color_eyre::Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("join {path:?} onto base URL {}", self.base_url))
    }

    /// Publish a new artifact descriptor, returning the descriptor as stored
    /// by the registry (which may assign `id`/`created_at`).
    #[instrument(skip(self), fields(repository, tag))]
    pub async fn publish(
        &self,
        project: &str,
        repository: &str,
        tag: &str,
        size_bytes: u64,
        labels: &super::Labels,
    ) -> color_eyre::Result<ArtifactDescriptor> {
        let url = self.endpoint(&format!("v1/projects/{project}/artifacts"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose())
            .json(&PublishRequest {
                repository,
                tag,
                size_bytes,
                labels,
            })
            .send()
            .await
            .context("send publish request")?;
        Self::parse_json(response).await
    }

    /// List every artifact published under a given content fingerprint.
    #[instrument(skip(self))]
    pub async fn list_by_fingerprint(
        &self,
        project: &str,
        fingerprint: &Fingerprint,
    ) -> color_eyre::Result<Vec<ArtifactDescriptor>> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/artifacts?fingerprint={}",
            fingerprint.to_hex()
        ))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send list-by-fingerprint request")?;
        Self::parse_json(response).await
    }

    /// List every artifact ever published under the project, regardless of
    /// fingerprint. The cleanup engine's starting candidate set.
    #[instrument(skip(self))]
    pub async fn list_all(&self, project: &str) -> color_eyre::Result<Vec<ArtifactDescriptor>> {
        let url = self.endpoint(&format!("v1/projects/{project}/artifacts"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send list-all-artifacts request")?;
        Self::parse_json(response).await
    }

    /// Fetch a single artifact by its fully qualified name.
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        project: &str,
        name: &str,
    ) -> color_eyre::Result<Option<ArtifactDescriptor>> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/artifacts/{}",
            urlencoding_path_segment(name)
        ))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send get-artifact request")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_json(response).await.map(Some)
    }

    /// Delete an artifact by its fully qualified name. Idempotent: deleting
    /// an artifact that no longer exists is not an error.
    #[instrument(skip(self))]
    pub async fn delete(&self, project: &str, name: &str) -> color_eyre::Result<()> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/artifacts/{}",
            urlencoding_path_segment(name)
        ))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send delete-artifact request")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response).await.map(drop)
    }

    /// List artifacts registered against a project's managed-image ledger.
    #[instrument(skip(self))]
    pub async fn list_managed_images(
        &self,
        project: &str,
    ) -> color_eyre::Result<Vec<ArtifactDescriptor>> {
        let url = self.endpoint(&format!("v1/projects/{project}/managed-images"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send list-managed-images request")?;
        Self::parse_json(response).await
    }

    /// Register an artifact as a managed image so it survives routine cache
    /// cleanup (it remains subject to history-based cleanup).
    #[instrument(skip(self))]
    pub async fn add_managed_image(&self, project: &str, name: &str) -> color_eyre::Result<()> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/managed-images/{}",
            urlencoding_path_segment(name)
        ))?;
        let response = self
            .http
            .put(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send add-managed-image request")?;
        Self::check_status(response).await.map(drop)
    }

    /// List every commit recorded against an image, under the registry's
    /// reserved image-metadata tag namespace.
    #[instrument(skip(self))]
    pub async fn list_commits(
        &self,
        project: &str,
        image: &str,
    ) -> color_eyre::Result<Vec<String>> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/images/{}/commits",
            urlencoding_path_segment(image)
        ))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send list-commits request")?;
        Self::parse_json(response).await
    }

    /// Fetch the metadata record for a single `(image, commit)` pair.
    #[instrument(skip(self))]
    pub async fn get_commit_metadata(
        &self,
        project: &str,
        image: &str,
        commit: &str,
    ) -> color_eyre::Result<Option<CommitRecord>> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/images/{}/commits/{}",
            urlencoding_path_segment(image),
            urlencoding_path_segment(commit)
        ))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send get-commit-metadata request")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_json(response).await.map(Some)
    }

    /// Idempotently record the fingerprint an `(image, commit)` pair built.
    #[instrument(skip(self))]
    pub async fn put_commit_metadata(
        &self,
        project: &str,
        record: &CommitRecord,
    ) -> color_eyre::Result<()> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/images/{}/commits/{}",
            urlencoding_path_segment(&record.image),
            urlencoding_path_segment(&record.commit)
        ))?;
        let response = self
            .http
            .put(url)
            .bearer_auth(self.token.expose())
            .json(&record.fingerprint)
            .send()
            .await
            .context("send put-commit-metadata request")?;
        Self::check_status(response).await.map(drop)
    }

    /// Remove a single `(image, commit)` metadata record. Idempotent.
    #[instrument(skip(self))]
    pub async fn remove_commit_metadata(
        &self,
        project: &str,
        image: &str,
        commit: &str,
    ) -> color_eyre::Result<()> {
        let url = self.endpoint(&format!(
            "v1/projects/{project}/images/{}/commits/{}",
            urlencoding_path_segment(image),
            urlencoding_path_segment(commit)
        ))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send remove-commit-metadata request")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response).await.map(drop)
    }

    async fn check_status(response: reqwest::Response) -> color_eyre::Result<reqwest::Response> {
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or_else(|_| body.clone());
        let mut report = eyre!("registry request failed with status {status}: {message}")
            .section(body.header("Response body:"));
        if let Some(id) = request_id {
            report = report.section(id.header("Request id:"));
        }
        Err(report)
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> color_eyre::Result<T> {
        let response = Self::check_status(response).await?;
        let body = response.text().await.context("read response body")?;
        serde_json::from_str(&body)
            .context("parse response body as JSON")
            .with_section(|| body.header("Response body:"))
    }
}

fn urlencoding_path_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}
