use super::fingerprint::ExecutionCacheKey;
use crate::workspace::ChangedFiles;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::*;
use tokio::fs;
use tracing::*;

/// Bumped whenever the shape of [ExecutionResult] changes; entries with
/// any other version are treated as misses.
const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("File system error when working with {path:?}, due to: {err:?}")]
    FileSystem { path: PathBuf, err: std::io::Error },

    #[error("Could not serialize execution result: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The cacheable output of running one task. Everything needed to produce
/// changeset specs without re-running the containers, and nothing that is
/// per-invocation (no timestamps, no log paths).
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub diff: String,
    pub changed_files: ChangedFiles,
    pub outputs: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    schema_version: u32,
    #[serde(flatten)]
    result: ExecutionResult,
}

/// Persists `fingerprint → ExecutionResult`. Implementations must be safe
/// under concurrent callers sharing the same backing store.
///
#[async_trait]
pub trait ExecutionCache: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &ExecutionCacheKey) -> Result<Option<ExecutionResult>, CacheError>;

    async fn set(&self, key: &ExecutionCacheKey, result: &ExecutionResult)
        -> Result<(), CacheError>;

    async fn clear(&self, key: &ExecutionCacheKey) -> Result<(), CacheError>;
}

/// One JSON file per key under a shared cache directory. Writes land in a
/// temp file first and are renamed into place, so concurrent readers only
/// ever see complete entries. Concurrent writers of the same key race and
/// the last rename wins; results are deterministic given the fingerprint.
///
#[derive(Debug, Clone)]
pub struct FileSystemCache {
    dir: PathBuf,
}

impl FileSystemCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &ExecutionCacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.hex()))
    }
}

#[async_trait]
impl ExecutionCache for FileSystemCache {
    #[tracing::instrument(name = "FileSystemCache::get", skip(self))]
    async fn get(&self, key: &ExecutionCacheKey) -> Result<Option<ExecutionResult>, CacheError> {
        let path = self.path_for(key);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CacheError::FileSystem { path, err }),
        };

        match serde_json::from_slice::<CacheFile>(&data) {
            Ok(file) if file.schema_version == CACHE_SCHEMA_VERSION => Ok(Some(file.result)),
            Ok(file) => {
                debug!(
                    "Ignoring cache entry {:?} with schema version {}",
                    path, file.schema_version
                );
                Ok(None)
            }
            Err(err) => {
                warn!("Removing corrupt cache entry {:?}: {}", path, err);
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    #[tracing::instrument(name = "FileSystemCache::set", skip(self, result))]
    async fn set(
        &self,
        key: &ExecutionCacheKey,
        result: &ExecutionResult,
    ) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| CacheError::FileSystem {
                path: self.dir.clone(),
                err,
            })?;

        let file = CacheFile {
            schema_version: CACHE_SCHEMA_VERSION,
            result: result.clone(),
        };
        let data = serde_json::to_vec(&file)?;

        let path = self.path_for(key);
        let tempfile = tempfile::NamedTempFile::new_in(&self.dir).map_err(|err| {
            CacheError::FileSystem {
                path: self.dir.clone(),
                err,
            }
        })?;
        std::io::Write::write_all(&mut tempfile.as_file(), &data).map_err(|err| {
            CacheError::FileSystem {
                path: tempfile.path().to_path_buf(),
                err,
            }
        })?;
        tempfile
            .persist(&path)
            .map_err(|err| CacheError::FileSystem {
                path: path.clone(),
                err: err.error,
            })?;

        Ok(())
    }

    #[tracing::instrument(name = "FileSystemCache::clear", skip(self))]
    async fn clear(&self, key: &ExecutionCacheKey) -> Result<(), CacheError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::FileSystem { path, err }),
        }
    }
}

/// In-memory implementation for tests and dry runs.
///
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, ExecutionResult>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ExecutionCache for InMemoryCache {
    async fn get(&self, key: &ExecutionCacheKey) -> Result<Option<ExecutionResult>, CacheError> {
        Ok(self.entries.get(&key.hex()).map(|e| e.value().clone()))
    }

    async fn set(
        &self,
        key: &ExecutionCacheKey,
        result: &ExecutionResult,
    ) -> Result<(), CacheError> {
        self.entries.insert(key.hex(), result.clone());
        Ok(())
    }

    async fn clear(&self, key: &ExecutionCacheKey) -> Result<(), CacheError> {
        self.entries.remove(&key.hex());
        Ok(())
    }
}
