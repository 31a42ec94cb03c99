use serde::{Deserialize, Serialize};

/// The code hosts the back end can open changesets on. Repositories on any
/// other host can be resolved and executed against, but their specs would
/// be rejected at upload time, so they are filtered out up front.
const SUPPORTED_SERVICE_TYPES: &[&str] = &["github", "gitlab", "bitbucketserver"];

/// A repository descriptor as returned by the back end, pinned to the
/// revision the campaign executes against.
///
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub external_repository: ExternalRepository,

    pub default_branch: Branch,

    /// Set when the spec pinned this repository to a specific branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRepository {
    pub service_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    pub target: Target,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub oid: String,
}

impl Repository {
    pub fn base_branch(&self) -> &Branch {
        self.branch.as_ref().unwrap_or(&self.default_branch)
    }

    /// The fully-qualified ref the changesets are based on.
    pub fn base_ref(&self) -> String {
        ensure_refs_heads(&self.base_branch().name)
    }

    /// The plain branch name, without the `refs/heads/` prefix.
    pub fn branch_name(&self) -> &str {
        strip_refs_heads(&self.base_branch().name)
    }

    /// The commit OID the campaign executes against.
    pub fn rev(&self) -> &str {
        &self.base_branch().target.oid
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_SERVICE_TYPES.contains(
            &self
                .external_repository
                .service_type
                .to_ascii_lowercase()
                .as_str(),
        )
    }
}

pub fn ensure_refs_heads(branch: &str) -> String {
    if branch.starts_with("refs/heads/") {
        branch.to_string()
    } else {
        format!("refs/heads/{}", branch)
    }
}

pub fn strip_refs_heads(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}
