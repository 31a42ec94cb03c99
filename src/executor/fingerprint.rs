use super::task::Task;
use crate::spec::{ChangesetTemplate, Output, TransformChanges};
use fxhash::FxHashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::*;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("Could not canonicalize task for hashing: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A stable digest over everything that can influence a task's result.
/// Two tasks hash identically iff their observable inputs are identical,
/// so the digest doubles as the execution cache key.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionCacheKey {
    digest: [u8; 32],
}

/// The canonical serialization of a task. Field order is fixed by the
/// struct, maps are `BTreeMap`s, and images appear as resolved content
/// digests rather than user-supplied tags, so a silent upstream rebuild
/// of `alpine:3` changes the key.
#[derive(Serialize)]
struct CanonicalTask<'a> {
    repository_id: &'a str,
    repository_rev: &'a str,
    steps: Vec<CanonicalStep<'a>>,
    transform: Option<&'a TransformChanges>,
    template: &'a ChangesetTemplate,
}

#[derive(Serialize)]
struct CanonicalStep<'a> {
    image: &'a str,
    run: &'a str,
    env: &'a BTreeMap<String, String>,
    outputs: &'a BTreeMap<String, Output>,
}

impl ExecutionCacheKey {
    pub fn for_task(
        task: &Task,
        image_digests: &FxHashMap<String, String>,
    ) -> Result<ExecutionCacheKey, FingerprintError> {
        let canonical = CanonicalTask {
            repository_id: &task.repository.id,
            repository_rev: task.repository.rev(),
            steps: task
                .steps
                .iter()
                .map(|step| CanonicalStep {
                    image: image_digests
                        .get(&step.container)
                        .map(|digest| digest.as_str())
                        .unwrap_or(&step.container),
                    run: &step.run,
                    env: &step.env,
                    outputs: &step.outputs,
                })
                .collect(),
            transform: task.transform.as_ref(),
            template: &task.template,
        };

        let bytes = serde_json::to_vec(&canonical)?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        Ok(ExecutionCacheKey { digest })
    }

    /// Lowercase hex form, used as the cache file name.
    pub fn hex(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for ExecutionCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}
