use crate::container::{ContainerError, ContainerRuntime, RunSpec};
use crate::spec::Step;
use crate::workspace::{ChangedFiles, TreeSnapshot, Workspace, WorkspaceError};
use std::sync::Arc;
use thiserror::*;
use tracing::*;

#[derive(Error, Debug)]
pub enum StepError {
    #[error("step failed with exit code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug)]
pub struct StepResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,

    /// What this step changed relative to the tree it started from.
    pub changed_files: ChangedFiles,

    /// The tree after this step; the next step diffs against it.
    pub snapshot: TreeSnapshot,
}

/// Runs one step in its container against a workspace and works out what
/// it changed by comparing tree snapshots.
///
#[derive(Debug, Clone)]
pub struct StepRunner {
    runtime: Arc<dyn ContainerRuntime>,
}

impl StepRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    #[tracing::instrument(name = "StepRunner::run", skip_all, fields(run = %step.run))]
    pub async fn run(
        &self,
        step: &Step,
        image: &str,
        workspace: &Workspace,
        before: &TreeSnapshot,
    ) -> Result<StepResult, StepError> {
        let spec = RunSpec {
            image: image.to_string(),
            workdir: workspace.work_root().to_path_buf(),
            run: step.run.clone(),
            env: step.env.clone(),
        };

        let output = self.runtime.run(&spec).await?;
        if !output.success() {
            return Err(StepError::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr_excerpt(),
            });
        }

        let snapshot = workspace.snapshot().await?;
        let changed_files = snapshot.changed_since(before);
        debug!(
            "Step changed {} files ({} added, {} deleted)",
            changed_files.modified.len(),
            changed_files.added.len(),
            changed_files.deleted.len()
        );

        Ok(StepResult {
            stdout: output.stdout,
            stderr: output.stderr,
            changed_files,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Branch, ExternalRepository, Repository, Target};
    use crate::archive::RepoArchive;
    use crate::container::RunOutput;
    use crate::workspace::WorkspaceCreator;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;

    /// Runs steps with the host shell straight against the work tree.
    #[derive(Debug)]
    struct HostShell;

    #[async_trait]
    impl ContainerRuntime for HostShell {
        async fn resolve_image(&self, image: &str) -> Result<String, ContainerError> {
            Ok(format!("sha256:{}", image))
        }

        async fn run(&self, spec: &RunSpec) -> Result<RunOutput, ContainerError> {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&spec.run)
                .current_dir(&spec.workdir)
                .envs(&spec.env)
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

    fn repo() -> Repository {
        Repository {
            id: "repo-1".into(),
            name: "github.com/sourcegraph/src-cli".into(),
            external_repository: ExternalRepository {
                service_type: "github".into(),
            },
            default_branch: Branch {
                name: "main".into(),
                target: Target {
                    oid: "d34db33f".into(),
                },
            },
            branch: None,
        }
    }

    fn tar_archive(dir: &Path, files: &[(&str, &str)]) -> RepoArchive {
        let path = dir.join("repo.tar");
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
        RepoArchive::new(path, "test".into())
    }

    fn step(run: &str) -> Step {
        Step {
            run: run.to_string(),
            container: "alpine:3".to_string(),
            env: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    async fn workspace(scratch: &Path) -> Workspace {
        let archive = tar_archive(scratch, &[("README.md", "# Welcome\n")]);
        WorkspaceCreator::new(scratch.join("tmp"))
            .create(&repo(), &archive)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn captures_output_and_changed_files() {
        let scratch = tempfile::tempdir().unwrap();
        let ws = workspace(scratch.path()).await;
        let before = ws.snapshot().await.unwrap();

        let runner = StepRunner::new(Arc::new(HostShell));
        let result = runner
            .run(
                &step("echo -n out && echo 'package main' > main.go"),
                "sha256:x",
                &ws,
                &before,
            )
            .await
            .unwrap();

        assert_eq!(result.stdout, b"out");
        assert_eq!(result.changed_files.added, vec!["main.go"]);
        assert!(result.changed_files.modified.is_empty());
    }

    #[tokio::test]
    async fn a_failing_step_reports_its_exit_code_and_stderr() {
        let scratch = tempfile::tempdir().unwrap();
        let ws = workspace(scratch.path()).await;
        let before = ws.snapshot().await.unwrap();

        let runner = StepRunner::new(Arc::new(HostShell));
        let err = runner
            .run(&step("echo boom >&2; exit 3"), "sha256:x", &ws, &before)
            .await
            .unwrap_err();

        assert_matches!(
            err,
            StepError::Failed { exit_code: 3, stderr } if stderr.contains("boom")
        );
    }

    #[tokio::test]
    async fn consecutive_steps_see_incremental_changes() {
        let scratch = tempfile::tempdir().unwrap();
        let ws = workspace(scratch.path()).await;
        let before = ws.snapshot().await.unwrap();

        let runner = StepRunner::new(Arc::new(HostShell));
        let first = runner
            .run(&step("echo one > one.txt"), "sha256:x", &ws, &before)
            .await
            .unwrap();
        let second = runner
            .run(&step("echo two > two.txt"), "sha256:x", &ws, &first.snapshot)
            .await
            .unwrap();

        assert_eq!(first.changed_files.added, vec!["one.txt"]);
        assert_eq!(second.changed_files.added, vec!["two.txt"]);
    }

    #[tokio::test]
    async fn the_step_env_is_visible_to_the_command() {
        let scratch = tempfile::tempdir().unwrap();
        let ws = workspace(scratch.path()).await;
        let before = ws.snapshot().await.unwrap();

        let mut with_env = step("echo -n $GREETING");
        with_env.env.insert("GREETING".into(), "hola".into());

        let runner = StepRunner::new(Arc::new(HostShell));
        let result = runner
            .run(&with_env, "sha256:x", &ws, &before)
            .await
            .unwrap();

        assert_eq!(result.stdout, b"hola");
    }
}
