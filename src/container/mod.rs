use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::*;
use tokio::process::Command;
use tracing::*;

/// Where the workspace's work tree is bind-mounted inside every container.
pub const CONTAINER_WORKDIR: &str = "/work";

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Could not invoke the container runtime: {err}")]
    Invocation { err: std::io::Error },

    #[error("Could not resolve image {image:?}: {detail}")]
    ImageResolution { image: String, detail: String },
}

#[derive(Debug, Clone)]
pub struct RunSpec {
    /// The image to run, preferably already resolved to a content digest.
    pub image: String,

    /// Host path of the workspace work tree; mounted at [CONTAINER_WORKDIR].
    pub workdir: PathBuf,

    /// Shell command executed as `sh -c <run>` inside the container.
    pub run: String,

    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// A short, printable tail of stderr for error messages.
    pub fn stderr_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let trimmed = text.trim_end();
        match trimmed.char_indices().nth_back(500) {
            Some((idx, _)) => format!("…{}", &trimmed[idx..]),
            None => trimmed.to_string(),
        }
    }
}

/// The opaque primitive the executor needs from a container runtime:
/// resolve a user-supplied image reference to a content digest, and run a
/// command against a bind-mounted workspace.
///
#[async_trait]
pub trait ContainerRuntime: Send + Sync + std::fmt::Debug {
    async fn resolve_image(&self, image: &str) -> Result<String, ContainerError>;

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, ContainerError>;
}

/// Shells out to the `docker` binary.
///
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }

    async fn inspect_digest(&self, image: &str) -> Result<Option<String>, ContainerError> {
        let output = Command::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ContainerError::Invocation { err })?;

        if !output.status.success() {
            return Ok(None);
        }

        let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if digest.is_empty() {
            Ok(None)
        } else {
            Ok(Some(digest))
        }
    }

    async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        debug!("Pulling image {}", image);
        let output = Command::new("docker")
            .args(["image", "pull", image])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ContainerError::Invocation { err })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ContainerError::ImageResolution {
                image: image.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[tracing::instrument(name = "DockerRuntime::resolve_image", skip(self))]
    async fn resolve_image(&self, image: &str) -> Result<String, ContainerError> {
        if let Some(digest) = self.inspect_digest(image).await? {
            return Ok(digest);
        }

        self.pull(image).await?;

        self.inspect_digest(image)
            .await?
            .ok_or_else(|| ContainerError::ImageResolution {
                image: image.to_string(),
                detail: "image has no content digest after pull".to_string(),
            })
    }

    #[tracing::instrument(name = "DockerRuntime::run", skip(self, spec), fields(image = %spec.image))]
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, ContainerError> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--init", "--workdir", CONTAINER_WORKDIR]);
        cmd.arg("--mount").arg(format!(
            "type=bind,source={},target={}",
            spec.workdir.display(),
            CONTAINER_WORKDIR
        ));
        for (key, value) in &spec.env {
            cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        cmd.args(["--entrypoint", "/bin/sh"]);
        cmd.arg(&spec.image);
        cmd.args(["-c", &spec.run]);

        // Dropping this future (cancellation, timeout) must take the
        // docker client process down with it.
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|err| ContainerError::Invocation { err })?;

        Ok(RunOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
