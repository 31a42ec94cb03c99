mod changeset_spec;
mod client;
mod repository;

pub use changeset_spec::{ChangesetSpec, GitCommitDescription, ImportedChangesetSpec};
pub use client::{ApiError, Client, HttpClient};
pub use repository::{ensure_refs_heads, strip_refs_heads, Branch, ExternalRepository, Repository, Target};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangesetSpecId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignSpecId(pub String);

impl std::fmt::Display for CampaignSpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repositories excluded from a run because their code host cannot receive
/// changesets. A sentinel, not an error: the run continues without them.
///
#[derive(Debug, Clone, Default)]
pub struct UnsupportedRepoSet {
    repos: Vec<Repository>,
}

impl UnsupportedRepoSet {
    pub fn append(&mut self, repo: Repository) {
        if !self.repos.iter().any(|r| r.id == repo.id) {
            self.repos.push(repo);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repos.iter().map(|r| r.name.as_str())
    }
}
