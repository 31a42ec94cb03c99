use super::{list_files, WorkspaceError};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// The files a step (or a whole task) touched, as workspace-relative paths.
/// Renames are never detected; a rename surfaces as an add plus a delete.
///
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFiles {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
}

impl ChangedFiles {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
            && self.added.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
    }

    /// Fold another delta into this one, keeping each list sorted and
    /// deduplicated.
    pub fn extend(&mut self, other: &ChangedFiles) {
        for (mine, theirs) in [
            (&mut self.modified, &other.modified),
            (&mut self.added, &other.added),
            (&mut self.deleted, &other.deleted),
            (&mut self.renamed, &other.renamed),
        ] {
            mine.extend(theirs.iter().cloned());
            mine.sort();
            mine.dedup();
        }
    }
}

/// A content-addressed picture of a directory tree at one point in time.
///
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    files: FxHashMap<PathBuf, String>,
}

impl TreeSnapshot {
    pub async fn capture(root: &Path) -> Result<TreeSnapshot, WorkspaceError> {
        let mut files = FxHashMap::default();
        for rel in list_files(root).await? {
            let full = root.join(&rel);
            let contents =
                tokio::fs::read(&full)
                    .await
                    .map_err(|err| WorkspaceError::FileSystem {
                        path: full.clone(),
                        err,
                    })?;
            files.insert(rel, format!("{:x}", Sha256::digest(&contents)));
        }
        Ok(TreeSnapshot { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The delta from `earlier` to `self`.
    pub fn changed_since(&self, earlier: &TreeSnapshot) -> ChangedFiles {
        let mut changed = ChangedFiles::default();

        for (path, hash) in &self.files {
            match earlier.files.get(path) {
                None => changed.added.push(path_string(path)),
                Some(old) if old != hash => changed.modified.push(path_string(path)),
                Some(_) => (),
            }
        }
        for path in earlier.files.keys() {
            if !self.files.contains_key(path) {
                changed.deleted.push(path_string(path));
            }
        }

        changed.modified.sort();
        changed.added.sort();
        changed.deleted.sort();
        changed
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
