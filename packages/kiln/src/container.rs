//! The container engine boundary.
//!
//! Executing the actual image build is delegated (§1's Non-goals): the
//! builder (I) only needs something that can take a base image plus a set
//! of commands/mounts/labels and hand back a committed image id. This
//! module defines that boundary as a trait, plus a small `docker` CLI
//! implementation in the same spirit as the teacher's own
//! `Command::new("docker")` invocations in its end-to-end harness.

use std::collections::BTreeMap;
use std::process::Stdio;

use color_eyre::eyre::{bail, Context};
use color_eyre::Result;
use tokio::process::Command;
use tracing::instrument;

/// A bind mount from the host into the build container.
#[derive(Clone, Debug)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
}

/// Everything one stage build needs from the container engine.
#[derive(Clone, Debug, Default)]
pub struct BuildSpec {
    pub base_image: String,
    pub commands: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub labels: BTreeMap<String, String>,
    /// Set only for the `dockerfile` stage variant, which bypasses
    /// `commands`/`mounts` entirely and drives a whole-file build instead.
    pub dockerfile: Option<DockerfileSpec>,
}

#[derive(Clone, Debug)]
pub struct DockerfileSpec {
    pub path: String,
    pub context: String,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
}

/// The id and size of a freshly built image, ready to be published.
#[derive(Clone, Debug)]
pub struct BuiltImage {
    pub id: String,
    pub size_bytes: u64,
}

pub trait ContainerEngine: Send + Sync {
    fn build(&self, spec: &BuildSpec) -> impl std::future::Future<Output = Result<BuiltImage>> + Send;
}

/// Drives the local `docker` CLI. Every call shells out; there is no
/// daemon connection held across calls, so this type is cheap to clone.
#[derive(Clone, Default)]
pub struct DockerCliEngine;

impl DockerCliEngine {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, mut command: Command) -> Result<String> {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = command.output().await.context("execute docker")?;
        if !output.status.success() {
            bail!(
                "docker exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn build_dockerfile(&self, dockerfile: &DockerfileSpec, labels: &BTreeMap<String, String>) -> Result<BuiltImage> {
        let mut command = Command::new("docker");
        command.arg("build").arg("-f").arg(&dockerfile.path);
        if let Some(target) = &dockerfile.target {
            command.arg("--target").arg(target);
        }
        for (key, value) in &dockerfile.build_args {
            command.arg("--build-arg").arg(format!("{key}={value}"));
        }
        for (key, value) in labels {
            command.arg("--label").arg(format!("{key}={value}"));
        }
        command.arg("--quiet").arg(&dockerfile.context);
        let id = self.run(command).await.context("docker build (dockerfile variant)")?;
        self.inspect_size(&id).await.map(|size_bytes| BuiltImage { id, size_bytes })
    }

    async fn build_shell(&self, spec: &BuildSpec) -> Result<BuiltImage> {
        let mut create = Command::new("docker");
        create.arg("create").arg("--entrypoint").arg("/bin/sh");
        for mount in &spec.mounts {
            create.arg("--mount").arg(format!(
                "type=bind,source={},target={}",
                mount.host_path, mount.container_path
            ));
        }
        create.arg(&spec.base_image).arg("-c").arg(shell_script(&spec.commands));
        let container_id = self.run(create).await.context("docker create")?;

        let mut start = Command::new("docker");
        start.arg("start").arg("--attach").arg(&container_id);
        self.run(start).await.context("docker start")?;

        let mut commit = Command::new("docker");
        commit.arg("commit");
        for (key, value) in &spec.labels {
            commit.arg("--change").arg(format!("LABEL {key}={value}"));
        }
        commit.arg(&container_id);
        let image_id = self.run(commit).await.context("docker commit")?;

        let mut remove = Command::new("docker");
        remove.arg("rm").arg(&container_id);
        self.run(remove).await.context("docker rm")?;

        self.inspect_size(&image_id).await.map(|size_bytes| BuiltImage { id: image_id, size_bytes })
    }

    #[instrument(skip(self))]
    async fn inspect_size(&self, image_id: &str) -> Result<u64> {
        let mut command = Command::new("docker");
        command.arg("inspect").arg("--format").arg("{{.Size}}").arg(image_id);
        let raw = self.run(command).await.context("docker inspect")?;
        raw.parse().context("parse image size")
    }
}

fn shell_script(commands: &[String]) -> String {
    commands.join(" && ")
}

impl ContainerEngine for DockerCliEngine {
    async fn build(&self, spec: &BuildSpec) -> Result<BuiltImage> {
        match &spec.dockerfile {
            Some(dockerfile) => self.build_dockerfile(dockerfile, &spec.labels).await,
            None => self.build_shell(spec).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_script_joins_commands_with_and() {
        let commands = vec!["apk add curl".to_string(), "echo done".to_string()];
        assert_eq!(shell_script(&commands), "apk add curl && echo done");
    }

    #[test]
    fn build_spec_default_has_no_dockerfile() {
        let spec = BuildSpec::default();
        assert!(spec.dockerfile.is_none());
    }
}
