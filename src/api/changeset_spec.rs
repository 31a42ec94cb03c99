use serde::{Deserialize, Serialize};

/// One unit of proposed change: a branch in a repository, the diff that
/// produces it, and the metadata the back end needs to open a changeset.
/// Serialized camelCase, matching the back end's wire format.
///
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetSpec {
    pub base_repository: String,
    pub base_ref: String,
    pub base_rev: String,
    pub head_repository: String,
    pub head_ref: String,
    pub title: String,
    pub body: String,
    pub commits: Vec<GitCommitDescription>,
    pub published: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitCommitDescription {
    pub message: String,
    pub diff: String,
    pub author_name: String,
    pub author_email: String,
}

/// A changeset that already exists on the code host and is merely tracked
/// by the campaign.
///
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportedChangesetSpec {
    pub base_repository: String,
    pub external_id: serde_json::Value,
}

impl ChangesetSpec {
    /// The branch this spec proposes, without the `refs/heads/` prefix.
    pub fn branch(&self) -> &str {
        super::repository::strip_refs_heads(&self.head_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let spec = ChangesetSpec {
            base_repository: "repo-1".into(),
            base_ref: "refs/heads/main".into(),
            base_rev: "d34db33f".into(),
            head_repository: "repo-1".into(),
            head_ref: "refs/heads/my-branch".into(),
            title: "t".into(),
            body: "b".into(),
            commits: vec![GitCommitDescription {
                message: "m".into(),
                diff: "".into(),
                author_name: "n".into(),
                author_email: "e".into(),
            }],
            published: false,
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["baseRepository"], "repo-1");
        assert_eq!(json["headRef"], "refs/heads/my-branch");
        assert_eq!(json["commits"][0]["authorEmail"], "e");
    }
}
