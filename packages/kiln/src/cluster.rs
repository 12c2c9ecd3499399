//! Component K: the in-use collector.
//!
//! Enumerates every container image reference a live cluster still points
//! at, across every workload kind that can pin one (§4.K). The result is a
//! whitelist the cleanup engine subtracts from its candidate-for-deletion
//! set before anything else runs. A failure enumerating any single
//! resource kind is fatal to the whole pass — the point is a conservative
//! whitelist, so a partial one is worse than none.

use std::collections::BTreeSet;

use color_eyre::eyre::Context;
use color_eyre::Result;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::instrument;

use crate::error::EngineError;

/// All image references a cluster's workloads currently pin, regardless of
/// namespace.
pub struct InUseCollector {
    client: Client,
}

impl InUseCollector {
    pub async fn connect(kube_config: Option<&str>, kube_context: Option<&str>) -> Result<Self> {
        let mut config = match kube_config {
            Some(path) => kube::Config::from_custom_kubeconfig(
                kube::config::Kubeconfig::read_from(path).context("read kubeconfig")?,
                &kube::config::KubeConfigOptions {
                    context: kube_context.map(str::to_string),
                    ..Default::default()
                },
            )
            .await
            .context("build kube config")?,
            None => kube::Config::infer().await.context("infer kube config")?,
        };
        if let Some(context) = kube_context {
            config.default_namespace = context.to_string();
        }
        let client = Client::try_from(config).map_err(|e| EngineError::ClusterEnumerationFailed.attach().wrap_err(e))?;
        Ok(Self { client })
    }

    #[cfg(test)]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Enumerate in-use images across the given namespaces, or every
    /// namespace visible to the client when `namespaces` is empty
    /// (`--check-all-namespaces`).
    #[instrument(skip(self))]
    pub async fn collect(&self, namespaces: &[String]) -> Result<BTreeSet<String>> {
        let mut images = BTreeSet::new();
        if namespaces.is_empty() {
            self.collect_namespace(None, &mut images).await?;
        } else {
            for namespace in namespaces {
                self.collect_namespace(Some(namespace.as_str()), &mut images).await?;
            }
        }
        Ok(images)
    }

    async fn collect_namespace(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        self.collect_pods(namespace, images).await?;
        self.collect_replication_controllers(namespace, images).await?;
        self.collect_deployments(namespace, images).await?;
        self.collect_stateful_sets(namespace, images).await?;
        self.collect_daemon_sets(namespace, images).await?;
        self.collect_replica_sets(namespace, images).await?;
        self.collect_cron_jobs(namespace, images).await?;
        self.collect_jobs(namespace, images).await?;
        Ok(())
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn collect_pods(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<Pod> = self.api(namespace);
        for pod in list(&api).await? {
            if let Some(spec) = pod.spec {
                for container in spec.containers {
                    if let Some(image) = container.image {
                        images.insert(image);
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_replication_controllers(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<ReplicationController> = self.api(namespace);
        for rc in list(&api).await? {
            if let Some(template) = rc.spec.and_then(|s| s.template) {
                if let Some(spec) = template.spec {
                    for container in spec.containers {
                        if let Some(image) = container.image {
                            images.insert(image);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_deployments(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<Deployment> = self.api(namespace);
        for deployment in list(&api).await? {
            if let Some(spec) = deployment.spec.and_then(|s| s.template.spec) {
                for container in spec.containers {
                    if let Some(image) = container.image {
                        images.insert(image);
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_stateful_sets(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<StatefulSet> = self.api(namespace);
        for set in list(&api).await? {
            if let Some(spec) = set.spec.and_then(|s| s.template.spec) {
                for container in spec.containers {
                    if let Some(image) = container.image {
                        images.insert(image);
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_daemon_sets(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<DaemonSet> = self.api(namespace);
        for set in list(&api).await? {
            if let Some(spec) = set.spec.and_then(|s| s.template.spec) {
                for container in spec.containers {
                    if let Some(image) = container.image {
                        images.insert(image);
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_replica_sets(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<ReplicaSet> = self.api(namespace);
        for set in list(&api).await? {
            if let Some(spec) = set.spec.and_then(|s| s.template).and_then(|t| t.spec) {
                for container in spec.containers {
                    if let Some(image) = container.image {
                        images.insert(image);
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_cron_jobs(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<CronJob> = self.api(namespace);
        for cron in list(&api).await? {
            if let Some(spec) = cron
                .spec
                .and_then(|s| s.job_template.spec)
                .and_then(|s| s.template.spec)
            {
                for container in spec.containers {
                    if let Some(image) = container.image {
                        images.insert(image);
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_jobs(&self, namespace: Option<&str>, images: &mut BTreeSet<String>) -> Result<()> {
        let api: Api<Job> = self.api(namespace);
        for job in list(&api).await? {
            if let Some(spec) = job.spec.and_then(|s| s.template.spec) {
                for container in spec.containers {
                    if let Some(image) = container.image {
                        images.insert(image);
                    }
                }
            }
        }
        Ok(())
    }
}

async fn list<K>(api: &Api<K>) -> Result<Vec<K>>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    <K as kube::Resource>::DynamicType: Default,
{
    api.list(&ListParams::default())
        .await
        .map(|list| list.items)
        .map_err(|e| EngineError::ClusterEnumerationFailed.attach().wrap_err(e))
}
