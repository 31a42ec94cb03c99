use crate::spec::Group;
use crate::workspace::{list_files, WorkspaceError};
use similar::TextDiff;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::*;

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("transformChanges would lead to multiple changesets in repository {repo} to have the same branch {branch:?}")]
    DuplicateBranch { repo: String, branch: String },

    #[error("transformChanges group branch for repository {repo} is the same as branch {branch:?} in changesetTemplate")]
    GroupBranchIsDefault { repo: String, branch: String },

    #[error("File system error when working with {path:?}, due to: {err:?}")]
    FileSystem { path: PathBuf, err: std::io::Error },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// One file's worth of a multi-file unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub text: String,
}

/// Build the unified diff for a single file, in git's no-prefix form.
/// `None` on either side marks the file as absent there.
pub fn unified_diff(path: &str, old: Option<&str>, new: Option<&str>) -> String {
    let (old_text, new_text) = (old.unwrap_or(""), new.unwrap_or(""));
    if old == new {
        return String::new();
    }

    let mut out = format!("diff --git {} {}\n", path, path);
    let (old_name, new_name) = match (old, new) {
        (None, _) => {
            out.push_str("new file mode 100644\n");
            ("/dev/null".to_string(), path.to_string())
        }
        (_, None) => {
            out.push_str("deleted file mode 100644\n");
            (path.to_string(), "/dev/null".to_string())
        }
        _ => (path.to_string(), path.to_string()),
    };

    let diff = TextDiff::from_lines(old_text, new_text);
    let mut unified = diff.unified_diff();
    unified.context_radius(3).header(&old_name, &new_name);
    out.push_str(&unified.to_string());
    out
}

/// The full diff between two directory trees, one [unified_diff] per
/// changed file, ordered by path.
pub async fn diff_trees(base: &Path, work: &Path) -> Result<String, DiffError> {
    let mut paths: BTreeSet<PathBuf> = list_files(base).await?.into_iter().collect();
    paths.extend(list_files(work).await?);

    let mut out = String::new();
    for path in paths {
        let old = read_lossy(&base.join(&path)).await?;
        let new = read_lossy(&work.join(&path)).await?;
        if old == new {
            continue;
        }

        let name = path.to_string_lossy().replace('\\', "/");
        out.push_str(&unified_diff(&name, old.as_deref(), new.as_deref()));
    }
    Ok(out)
}

async fn read_lossy(path: &Path) -> Result<Option<String>, DiffError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DiffError::FileSystem {
            path: path.to_path_buf(),
            err,
        }),
    }
}

/// Split a multi-file unified diff back into per-file diffs. The file name
/// is taken from the `+++` header, falling back to `---` for deletions.
pub fn parse_multi_file_diff(diff: &str) -> Vec<FileDiff> {
    let mut files = vec![];
    let mut current: Option<String> = None;

    for line in diff.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            if let Some(text) = current.take() {
                files.push(chunk_to_file_diff(text));
            }
            current = Some(String::new());
        }
        if let Some(text) = current.as_mut() {
            text.push_str(line);
        }
    }
    if let Some(text) = current.take() {
        files.push(chunk_to_file_diff(text));
    }

    files
}

fn chunk_to_file_diff(text: String) -> FileDiff {
    let mut old_name = None;
    let mut new_name = None;
    for line in text.lines() {
        if let Some(name) = line.strip_prefix("--- ") {
            old_name.get_or_insert_with(|| name.trim().to_string());
        }
        if let Some(name) = line.strip_prefix("+++ ") {
            new_name.get_or_insert_with(|| name.trim().to_string());
        }
        if line.starts_with("@@") {
            break;
        }
    }

    let path = match (old_name, new_name) {
        (_, Some(name)) if name != "/dev/null" => name,
        (Some(name), _) if name != "/dev/null" => name,
        _ => String::new(),
    };

    FileDiff { path, text }
}

/// The groups that apply to one repository: those without a repository
/// restriction plus those restricted to exactly this one.
pub fn groups_for_repository(repo_name: &str, groups: &[Group]) -> Vec<Group> {
    groups
        .iter()
        .filter(|g| match &g.repository {
            Some(restricted) => restricted == repo_name,
            None => true,
        })
        .cloned()
        .collect()
}

/// Reject group sets that would produce colliding changesets for this
/// repository.
pub fn validate_groups(
    repo_name: &str,
    default_branch: &str,
    groups: &[Group],
) -> Result<(), DiffError> {
    let mut unique_branches = BTreeSet::new();

    for group in groups {
        if let Some(restricted) = &group.repository {
            if restricted != repo_name {
                continue;
            }
        }

        if !unique_branches.insert(group.branch.as_str()) {
            return Err(DiffError::DuplicateBranch {
                repo: repo_name.to_string(),
                branch: group.branch.clone(),
            });
        }

        if group.branch == default_branch {
            return Err(DiffError::GroupBranchIsDefault {
                repo: repo_name.to_string(),
                branch: default_branch.to_string(),
            });
        }
    }

    Ok(())
}

/// Partition a diff into branches. Every file diff starts on the default
/// branch; each group whose directory prefixes the file path moves it, and
/// the last matching group wins. The default branch always has an entry,
/// possibly empty.
pub fn group_file_diffs(
    complete_diff: &str,
    default_branch: &str,
    groups: &[Group],
) -> BTreeMap<String, String> {
    let mut by_branch = BTreeMap::new();
    by_branch.insert(default_branch.to_string(), String::new());

    for file_diff in parse_multi_file_diff(complete_diff) {
        let mut branch = default_branch;
        for group in groups {
            if path_has_prefix(&file_diff.path, &group.directory) {
                branch = &group.branch;
            }
        }

        by_branch
            .entry(branch.to_string())
            .or_default()
            .push_str(&file_diff.text);
    }

    by_branch
}

/// Directory-prefix match on whole path components; the empty directory
/// matches every path.
fn path_has_prefix(path: &str, directory: &str) -> bool {
    if directory.is_empty() {
        return true;
    }
    path == directory || path.starts_with(&format!("{}/", directory))
}
