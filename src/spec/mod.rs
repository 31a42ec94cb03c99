mod overridable;

pub use overridable::{OverridableBool, OverridableString};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::*;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Could not parse campaign spec: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("The campaign spec is missing a name")]
    MissingName,

    #[error("The campaign spec has steps but no changesetTemplate to describe the changesets")]
    MissingChangesetTemplate,

    #[error("The changesetTemplate is missing a branch")]
    MissingTemplateBranch,

    #[error("The campaign spec has steps but no 'on' entries to select repositories")]
    NoRepositories,

    #[error("transformChanges group with directory {directory:?} is missing a branch")]
    EmptyGroupBranch { directory: String },
}

/// The user-supplied description of a batch of repository-wide changes:
/// which repositories to select, which steps to run in which containers,
/// and how to describe the resulting changesets.
///
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CampaignSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub on: Vec<OnQueryOrRepository>,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub import_changesets: Vec<ImportChangeset>,

    pub changeset_template: Option<ChangesetTemplate>,

    #[serde(default)]
    pub transform_changes: Option<TransformChanges>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OnQueryOrRepository {
    #[serde(default)]
    pub repositories_matching_query: Option<String>,

    #[serde(default)]
    pub repository: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,
}

impl std::fmt::Display for OnQueryOrRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(query) = &self.repositories_matching_query {
            write!(f, "{}", query)
        } else if let Some(repo) = &self.repository {
            write!(f, "r:{}", repo)
        } else {
            write!(f, "<empty on: entry>")
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImportChangeset {
    pub repository: String,
    pub external_ids: Vec<serde_yaml::Value>,
}

/// One shell command executed inside a container image against the
/// workspace. Env and outputs are kept sorted so serialization and
/// fingerprinting are deterministic.
///
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub run: String,
    pub container: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Output {
    pub value: String,

    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Yaml,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangesetTemplate {
    #[serde(default)]
    pub title: OverridableString,

    #[serde(default)]
    pub body: String,

    pub branch: String,

    #[serde(default)]
    pub commit: CommitTemplate,

    #[serde(default)]
    pub published: OverridableBool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitTemplate {
    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<GitCommitAuthor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GitCommitAuthor {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransformChanges {
    #[serde(default)]
    pub group: Vec<Group>,
}

/// A rule routing every file diff under `directory` to its own branch.
/// Ordering is significant: the last matching group wins.
///
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Group {
    pub directory: String,
    pub branch: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl CampaignSpec {
    pub fn parse(data: &str) -> Result<CampaignSpec, SpecError> {
        let spec: CampaignSpec = serde_yaml::from_str(data)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::MissingName);
        }

        if !self.steps.is_empty() {
            if self.on.is_empty() {
                return Err(SpecError::NoRepositories);
            }
            let template = self
                .changeset_template
                .as_ref()
                .ok_or(SpecError::MissingChangesetTemplate)?;
            if template.branch.is_empty() {
                return Err(SpecError::MissingTemplateBranch);
            }
        }

        if let Some(transform) = &self.transform_changes {
            for group in &transform.group {
                if group.branch.is_empty() {
                    return Err(SpecError::EmptyGroupBranch {
                        directory: group.directory.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SPEC: &str = r#"
name: hello-world
description: Add Hello World to READMEs
on:
  - repositoriesMatchingQuery: file:README.md
  - repository: github.com/sourcegraph/src-cli
    branch: release
steps:
  - run: echo Hello World | tee -a $(find -name README.md)
    container: alpine:3
    env:
      FOO: bar
    outputs:
      greeting:
        value: "${{ step.stdout }}"
changesetTemplate:
  title: Hello World
  body: My first campaign!
  branch: hello-world
  commit:
    message: Append Hello World to all README.md files
    author:
      name: Campaign Bot
      email: bot@example.com
  published: false
"#;

    #[test]
    fn parses_a_complete_spec() {
        let spec = CampaignSpec::parse(SPEC).unwrap();

        assert_eq!(spec.name, "hello-world");
        assert_eq!(spec.on.len(), 2);
        assert_eq!(spec.on[1].branch.as_deref(), Some("release"));
        assert_eq!(spec.steps.len(), 1);
        assert_eq!(spec.steps[0].env.get("FOO").unwrap(), "bar");
        assert_eq!(
            spec.steps[0].outputs.get("greeting").unwrap().format,
            OutputFormat::Text
        );

        let template = spec.changeset_template.unwrap();
        assert_eq!(template.branch, "hello-world");
        assert_eq!(template.title.value("github.com/any/repo"), "Hello World");
        assert!(!template.published.value("github.com/any/repo"));
        assert_eq!(
            template.commit.author,
            Some(GitCommitAuthor {
                name: "Campaign Bot".into(),
                email: "bot@example.com".into(),
            })
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let res = CampaignSpec::parse("name: x\nsteps: []\nnot_a_field: true\n");
        assert_matches!(res, Err(SpecError::Parse(_)));
    }

    #[test]
    fn steps_require_a_changeset_template() {
        let res = CampaignSpec::parse(
            r#"
name: x
on:
  - repositoriesMatchingQuery: lang:go
steps:
  - run: "true"
    container: alpine:3
"#,
        );
        assert_matches!(res, Err(SpecError::MissingChangesetTemplate));
    }

    #[test]
    fn steps_require_repositories() {
        let res = CampaignSpec::parse(
            r#"
name: x
steps:
  - run: "true"
    container: alpine:3
changesetTemplate:
  branch: b
"#,
        );
        assert_matches!(res, Err(SpecError::NoRepositories));
    }

    #[test]
    fn groups_require_branches() {
        let res = CampaignSpec::parse(
            r#"
name: x
transformChanges:
  group:
    - directory: a/b
      branch: ""
"#,
        );
        assert_matches!(res, Err(SpecError::EmptyGroupBranch { directory }) if directory == "a/b");
    }

    #[test]
    fn output_formats_deserialize() {
        let step: Step = serde_yaml::from_str(
            r#"
run: "true"
container: alpine:3
outputs:
  a:
    value: "1"
    format: yaml
  b:
    value: "2"
    format: json
"#,
        )
        .unwrap();
        assert_eq!(step.outputs["a"].format, OutputFormat::Yaml);
        assert_eq!(step.outputs["b"].format, OutputFormat::Json);
    }
}
