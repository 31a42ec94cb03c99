use crate::api::Repository;
use async_trait::async_trait;
use futures::StreamExt;
use fxhash::FxHashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::*;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::*;
use url::Url;

#[derive(Error, Debug)]
pub enum RepoFetcherError {
    #[error("File system error when working with {path:?}, due to: {err:?}")]
    FileSystem { path: PathBuf, err: std::io::Error },

    #[error("Could not download {url} due to: {err:?}")]
    CouldNotDownload { url: Url, err: reqwest::Error },

    #[error("Failed download of {url} with status: {status}")]
    DownloadFailed {
        url: Url,
        status: reqwest::StatusCode,
    },

    #[error("Could not stream download of {url} due to: {err:?}")]
    Streaming { url: Url, err: std::io::Error },

    #[error("Invalid archive URL for repository {name:?}: {err}")]
    InvalidUrl { name: String, err: url::ParseError },
}

/// A downloaded repository archive on disk. Handles are cheap to clone and
/// can be read independently; the scratch file is removed when the last
/// handle drops.
///
#[derive(Debug, Clone)]
pub struct RepoArchive {
    inner: Arc<ArchiveInner>,
}

#[derive(Debug)]
struct ArchiveInner {
    path: PathBuf,
    hash: String,
}

impl Drop for ArchiveInner {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl RepoArchive {
    pub fn new(path: PathBuf, hash: String) -> Self {
        Self {
            inner: Arc::new(ArchiveInner { path, hash }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn hash(&self) -> &str {
        &self.inner.hash
    }
}

/// Fetches the archive of a repository at its base revision.
///
#[async_trait]
pub trait RepoFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, repo: &Repository) -> Result<RepoArchive, RepoFetcherError>;
}

/// Streams zip archives from the back end's raw endpoint. Concurrent
/// fetches of the same (repository, revision) share one download.
///
#[derive(Debug)]
pub struct HttpRepoFetcher {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
    dir: PathBuf,
    inflight: Mutex<FxHashMap<String, Arc<OnceCell<RepoArchive>>>>,
}

impl HttpRepoFetcher {
    pub fn new(endpoint: Url, token: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token: token.into(),
            dir,
            inflight: Mutex::new(FxHashMap::default()),
        }
    }

    fn archive_url(&self, repo: &Repository) -> Result<Url, RepoFetcherError> {
        let raw = format!(
            "{}/{}@{}/-/raw",
            self.endpoint.as_str().trim_end_matches('/'),
            repo.name,
            repo.rev()
        );
        Url::parse(&raw).map_err(|err| RepoFetcherError::InvalidUrl {
            name: repo.name.clone(),
            err,
        })
    }

    #[tracing::instrument(name = "HttpRepoFetcher::download", skip(self, repo), fields(repo = %repo.name))]
    async fn download(&self, repo: &Repository) -> Result<RepoArchive, RepoFetcherError> {
        let url = self.archive_url(repo)?;

        let response = self
            .client
            .get(url.clone())
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/zip")
            .send()
            .await
            .map_err(|err| RepoFetcherError::CouldNotDownload {
                url: url.clone(),
                err,
            })?;

        if !response.status().is_success() {
            return Err(RepoFetcherError::DownloadFailed {
                url,
                status: response.status(),
            });
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| RepoFetcherError::FileSystem {
                path: self.dir.clone(),
                err,
            })?;

        let tempfile = tempfile::NamedTempFile::new_in(&self.dir).map_err(|err| {
            RepoFetcherError::FileSystem {
                path: self.dir.clone(),
                err,
            }
        })?;
        let mut outfile = fs::File::from_std(tempfile.reopen().map_err(|err| {
            RepoFetcherError::FileSystem {
                path: tempfile.path().to_path_buf(),
                err,
            }
        })?);

        let mut byte_stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        while let Some(chunk) = byte_stream.next().await {
            let mut chunk = chunk.map_err(|err| RepoFetcherError::CouldNotDownload {
                url: url.clone(),
                err,
            })?;
            hasher.update(&chunk);
            outfile
                .write_all_buf(&mut chunk)
                .await
                .map_err(|err| RepoFetcherError::Streaming {
                    url: url.clone(),
                    err,
                })?;
        }
        outfile
            .flush()
            .await
            .map_err(|err| RepoFetcherError::Streaming {
                url: url.clone(),
                err,
            })?;

        let hash = format!("{:x}", hasher.finalize());
        let path = self.dir.join(format!("{}.zip", &hash));
        tempfile
            .persist(&path)
            .map_err(|err| RepoFetcherError::FileSystem {
                path: path.clone(),
                err: err.error,
            })?;

        debug!("Downloaded {} to {:?}", repo.name, path);
        Ok(RepoArchive::new(path, hash))
    }
}

#[async_trait]
impl RepoFetcher for HttpRepoFetcher {
    #[tracing::instrument(name = "HttpRepoFetcher::fetch", skip(self, repo), fields(repo = %repo.name))]
    async fn fetch(&self, repo: &Repository) -> Result<RepoArchive, RepoFetcherError> {
        let key = format!("{}@{}", repo.id, repo.rev());

        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key).or_default().clone()
        };

        let archive = cell.get_or_try_init(|| self.download(repo)).await?;
        Ok(archive.clone())
    }
}
