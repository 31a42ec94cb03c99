use super::*;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::*;
use tracing::*;
use url::Url;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Could not reach the back end at {endpoint}: {err}")]
    Transport {
        endpoint: String,
        err: reqwest::Error,
    },

    #[error("The back end rejected the request: {}", messages.join("; "))]
    GraphQl { messages: Vec<String> },

    #[error("Could not decode the back end's response: {0}")]
    Decode(serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(url::ParseError),

    #[error("No user or organization found with name {name:?}")]
    UnknownNamespace { name: String },

    #[error("No repository found with name {name:?}")]
    UnknownRepository { name: String },

    #[error("No branch {branch:?} in repository {name:?}")]
    UnknownBranch { name: String, branch: String },
}

/// The back-end operations the campaign flow needs. Kept behind a trait so
/// the service can be driven against a double.
///
#[async_trait]
pub trait Client: Send + Sync + std::fmt::Debug {
    async fn resolve_namespace(&self, name: &str) -> Result<NamespaceId, ApiError>;

    async fn resolve_repositories_matching_query(
        &self,
        query: &str,
    ) -> Result<Vec<Repository>, ApiError>;

    async fn resolve_repository(
        &self,
        name: &str,
        branch: Option<&str>,
    ) -> Result<Repository, ApiError>;

    async fn create_changeset_spec(
        &self,
        raw: serde_json::Value,
    ) -> Result<ChangesetSpecId, ApiError>;

    async fn create_campaign_spec(
        &self,
        namespace: &NamespaceId,
        raw_spec: &str,
        ids: &[ChangesetSpecId],
    ) -> Result<(CampaignSpecId, Url), ApiError>;
}

const REPOSITORY_FIELDS: &str = r#"
fragment repositoryFields on Repository {
    id
    name
    externalRepository { serviceType }
    defaultBranch { name target { oid } }
}
"#;

#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

impl HttpClient {
    pub fn new(endpoint: Url, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            token: token.into(),
        }
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, ApiError> {
        let url = self
            .endpoint
            .join(".api/graphql")
            .map_err(ApiError::InvalidUrl)?;

        let response = self
            .http
            .post(url.clone())
            .header("Authorization", format!("token {}", self.token))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| ApiError::Transport {
                endpoint: url.to_string(),
                err,
            })?;

        let payload: GraphQlResponse<T> =
            response.json().await.map_err(|err| ApiError::Transport {
                endpoint: url.to_string(),
                err,
            })?;

        if let Some(errors) = payload.errors {
            return Err(ApiError::GraphQl {
                messages: errors.into_iter().map(|e| e.message).collect(),
            });
        }

        payload.data.ok_or_else(|| ApiError::GraphQl {
            messages: vec!["empty response".to_string()],
        })
    }
}

#[async_trait]
impl Client for HttpClient {
    #[tracing::instrument(name = "HttpClient::resolve_namespace", skip(self))]
    async fn resolve_namespace(&self, name: &str) -> Result<NamespaceId, ApiError> {
        #[derive(Deserialize)]
        struct Data {
            user: Option<Node>,
            organization: Option<Node>,
        }
        #[derive(Deserialize)]
        struct Node {
            id: String,
        }

        let query = r#"
query NamespaceQuery($name: String!) {
    user(username: $name) { id }
    organization(name: $name) { id }
}
"#;

        let data: Data = self.graphql(query, json!({ "name": name })).await?;
        data.user
            .or(data.organization)
            .map(|node| NamespaceId(node.id))
            .ok_or_else(|| ApiError::UnknownNamespace {
                name: name.to_string(),
            })
    }

    #[tracing::instrument(name = "HttpClient::resolve_repositories_matching_query", skip(self))]
    async fn resolve_repositories_matching_query(
        &self,
        query: &str,
    ) -> Result<Vec<Repository>, ApiError> {
        #[derive(Deserialize)]
        struct Data {
            search: Search,
        }
        #[derive(Deserialize)]
        struct Search {
            results: SearchResults,
        }
        #[derive(Deserialize)]
        struct SearchResults {
            results: Vec<SearchResult>,
        }
        #[derive(Deserialize)]
        #[serde(tag = "__typename")]
        enum SearchResult {
            Repository(Repository),
            FileMatch { repository: Repository },
            #[serde(other)]
            Other,
        }

        let gql = format!(
            r#"
query Repositories($query: String!) {{
    search(query: $query, version: V2) {{
        results {{
            results {{
                __typename
                ... on Repository {{ ...repositoryFields }}
                ... on FileMatch {{ repository {{ ...repositoryFields }} }}
            }}
        }}
    }}
}}
{}"#,
            REPOSITORY_FIELDS
        );

        let data: Data = self.graphql(&gql, json!({ "query": query })).await?;

        let mut seen = fxhash::FxHashSet::default();
        let mut repos = vec![];
        for result in data.search.results.results {
            let repo = match result {
                SearchResult::Repository(repo) => repo,
                SearchResult::FileMatch { repository } => repository,
                SearchResult::Other => continue,
            };
            if seen.insert(repo.id.clone()) {
                repos.push(repo);
            }
        }

        debug!("Query {:?} resolved to {} repositories", query, repos.len());
        Ok(repos)
    }

    #[tracing::instrument(name = "HttpClient::resolve_repository", skip(self))]
    async fn resolve_repository(
        &self,
        name: &str,
        branch: Option<&str>,
    ) -> Result<Repository, ApiError> {
        #[derive(Deserialize)]
        struct Data {
            repository: Option<Repository>,
        }

        let gql = format!(
            r#"
query Repository($name: String!, $branch: String!, $queryBranch: Boolean!) {{
    repository(name: $name) {{
        ...repositoryFields
        branch(name: $branch) @include(if: $queryBranch) {{
            name
            target {{ oid }}
        }}
    }}
}}
{}"#,
            REPOSITORY_FIELDS
        );

        let data: Data = self
            .graphql(
                &gql,
                json!({
                    "name": name,
                    "branch": branch.unwrap_or(""),
                    "queryBranch": branch.is_some(),
                }),
            )
            .await?;

        let repo = data.repository.ok_or_else(|| ApiError::UnknownRepository {
            name: name.to_string(),
        })?;

        if let Some(wanted) = branch {
            if repo.branch.is_none() {
                return Err(ApiError::UnknownBranch {
                    name: name.to_string(),
                    branch: wanted.to_string(),
                });
            }
        }

        Ok(repo)
    }

    #[tracing::instrument(name = "HttpClient::create_changeset_spec", skip(self, raw))]
    async fn create_changeset_spec(
        &self,
        raw: serde_json::Value,
    ) -> Result<ChangesetSpecId, ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            create_changeset_spec: Node,
        }
        #[derive(Deserialize)]
        struct Node {
            id: String,
        }

        let query = r#"
mutation CreateChangesetSpec($spec: String!) {
    createChangesetSpec(changesetSpec: $spec) {
        ... on HiddenChangesetSpec { id }
        ... on VisibleChangesetSpec { id }
    }
}
"#;

        let spec = serde_json::to_string(&raw).map_err(ApiError::Decode)?;
        let data: Data = self.graphql(query, json!({ "spec": spec })).await?;
        Ok(ChangesetSpecId(data.create_changeset_spec.id))
    }

    #[tracing::instrument(name = "HttpClient::create_campaign_spec", skip(self, raw_spec, ids))]
    async fn create_campaign_spec(
        &self,
        namespace: &NamespaceId,
        raw_spec: &str,
        ids: &[ChangesetSpecId],
    ) -> Result<(CampaignSpecId, Url), ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            create_campaign_spec: Node,
        }
        #[derive(Deserialize)]
        struct Node {
            id: String,
            #[serde(rename = "applyURL")]
            apply_url: String,
        }

        let query = r#"
mutation CreateCampaignSpec($namespace: ID!, $spec: String!, $changesetSpecs: [ID!]!) {
    createCampaignSpec(namespace: $namespace, campaignSpec: $spec, changesetSpecIDs: $changesetSpecs) {
        id
        applyURL
    }
}
"#;

        let data: Data = self
            .graphql(
                query,
                json!({
                    "namespace": namespace.0,
                    "spec": raw_spec,
                    "changesetSpecs": ids.iter().map(|id| id.0.clone()).collect::<Vec<_>>(),
                }),
            )
            .await?;

        let url = self
            .endpoint
            .join(&data.create_campaign_spec.apply_url)
            .map_err(ApiError::InvalidUrl)?;

        Ok((CampaignSpecId(data.create_campaign_spec.id), url))
    }
}
