use crate::api::{
    ApiError, CampaignSpecId, ChangesetSpec, ChangesetSpecId, Client, ImportedChangesetSpec,
    NamespaceId, Repository, UnsupportedRepoSet,
};
use crate::spec::CampaignSpec;
use fxhash::FxHashSet;
use std::sync::Arc;
use thiserror::*;
use tracing::*;
use url::Url;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("External ID for repository {repository} must be a string or a number")]
    BadExternalId { repository: String },
}

/// The outcome of resolving a campaign spec's `on` entries: repositories
/// to execute against, plus the ones excluded for living on unsupported
/// code hosts.
///
#[derive(Debug, Default)]
pub struct RepoResolution {
    pub repos: Vec<Repository>,
    pub unsupported: UnsupportedRepoSet,
}

/// Ties the campaign flow together on top of the API client: resolve
/// namespaces and repositories, and push finished specs to the back end.
///
#[derive(Debug, Clone)]
pub struct Service {
    client: Arc<dyn Client>,
}

impl Service {
    pub fn new(client: Arc<dyn Client>) -> Service {
        Service { client }
    }

    pub async fn resolve_namespace(&self, name: &str) -> Result<NamespaceId, ServiceError> {
        Ok(self.client.resolve_namespace(name).await?)
    }

    /// Resolve every `on` entry, deduplicating by repository ID with the
    /// first occurrence winning. Unless `allow_unsupported` is set,
    /// repositories on unsupported code hosts land in the sentinel set
    /// instead of the work list.
    #[tracing::instrument(name = "Service::resolve_repositories", skip_all)]
    pub async fn resolve_repositories(
        &self,
        spec: &CampaignSpec,
        allow_unsupported: bool,
    ) -> Result<RepoResolution, ServiceError> {
        let mut seen = FxHashSet::default();
        let mut resolution = RepoResolution::default();

        for on in &spec.on {
            let batch = if let Some(query) = &on.repositories_matching_query {
                self.client.resolve_repositories_matching_query(query).await?
            } else if let Some(name) = &on.repository {
                vec![
                    self.client
                        .resolve_repository(name, on.branch.as_deref())
                        .await?,
                ]
            } else {
                continue;
            };

            for repo in batch {
                if !seen.insert(repo.id.clone()) {
                    continue;
                }
                if repo.is_supported() || allow_unsupported {
                    resolution.repos.push(repo);
                } else {
                    resolution.unsupported.append(repo);
                }
            }
        }

        debug!(
            "Resolved {} repositories ({} unsupported)",
            resolution.repos.len(),
            resolution.unsupported.len()
        );
        Ok(resolution)
    }

    /// Turn the spec's `importChangesets` entries into uploadable specs,
    /// resolving each repository name to its ID.
    pub async fn build_import_specs(
        &self,
        spec: &CampaignSpec,
    ) -> Result<Vec<ImportedChangesetSpec>, ServiceError> {
        let mut specs = vec![];

        for import in &spec.import_changesets {
            let repo = self.client.resolve_repository(&import.repository, None).await?;

            for external_id in &import.external_ids {
                let external_id = match external_id {
                    serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
                    serde_yaml::Value::Number(n) if n.as_i64().is_some() => {
                        serde_json::json!(n.as_i64().unwrap())
                    }
                    _ => {
                        return Err(ServiceError::BadExternalId {
                            repository: import.repository.clone(),
                        })
                    }
                };
                specs.push(ImportedChangesetSpec {
                    base_repository: repo.id.clone(),
                    external_id,
                });
            }
        }

        Ok(specs)
    }

    /// Upload branch and imported changeset specs, invoking `progress`
    /// after each one.
    pub async fn upload_changeset_specs(
        &self,
        specs: &[ChangesetSpec],
        imports: &[ImportedChangesetSpec],
        mut progress: impl FnMut(usize),
    ) -> Result<Vec<ChangesetSpecId>, ServiceError> {
        let mut ids = Vec::with_capacity(specs.len() + imports.len());

        for spec in specs {
            let raw = serde_json::to_value(spec).map_err(|err| {
                ServiceError::Api(ApiError::Decode(err))
            })?;
            ids.push(self.client.create_changeset_spec(raw).await?);
            progress(ids.len());
        }
        for import in imports {
            let raw = serde_json::to_value(import).map_err(|err| {
                ServiceError::Api(ApiError::Decode(err))
            })?;
            ids.push(self.client.create_changeset_spec(raw).await?);
            progress(ids.len());
        }

        Ok(ids)
    }

    pub async fn upload_campaign_spec(
        &self,
        namespace: &NamespaceId,
        raw_spec: &str,
        ids: &[ChangesetSpecId],
    ) -> Result<(CampaignSpecId, Url), ServiceError> {
        Ok(self
            .client
            .create_campaign_spec(namespace, raw_spec, ids)
            .await?)
    }
}
