mod snapshot;

pub use snapshot::{ChangedFiles, TreeSnapshot};

use crate::archive::RepoArchive;
use crate::api::Repository;
use async_compression::futures::bufread::GzipDecoder;
use futures::AsyncReadExt;
use std::path::{Path, PathBuf};
use thiserror::*;
use tokio::fs;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::*;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("File system error when working with {path:?}, due to: {err:?}")]
    FileSystem { path: PathBuf, err: std::io::Error },

    #[error("Could not extract archive {src:?} into {dst:?}, due to: {err:?}")]
    Extraction {
        src: PathBuf,
        dst: PathBuf,
        err: anyhow::Error,
    },
}

/// Creates scoped workspaces under a temp prefix. The prefix is
/// configurable because container runtimes cannot always bind-mount the
/// platform default temp location.
///
#[derive(Debug, Clone)]
pub struct WorkspaceCreator {
    temp_prefix: PathBuf,
}

impl WorkspaceCreator {
    pub fn new(temp_prefix: PathBuf) -> Self {
        Self { temp_prefix }
    }

    /// Materialize `archive` into a fresh workspace: a `work` tree the
    /// steps run against and an untouched `base` tree used for diffing.
    #[tracing::instrument(name = "WorkspaceCreator::create", skip(self, repo, archive), fields(repo = %repo.name))]
    pub async fn create(
        &self,
        repo: &Repository,
        archive: &RepoArchive,
    ) -> Result<Workspace, WorkspaceError> {
        fs::create_dir_all(&self.temp_prefix)
            .await
            .map_err(|err| WorkspaceError::FileSystem {
                path: self.temp_prefix.clone(),
                err,
            })?;

        let dir = tempfile::Builder::new()
            .prefix("workspace-")
            .tempdir_in(&self.temp_prefix)
            .map_err(|err| WorkspaceError::FileSystem {
                path: self.temp_prefix.clone(),
                err,
            })?;

        let work = dir.path().join("work");
        let base = dir.path().join("base");
        for tree in [&work, &base] {
            fs::create_dir_all(tree)
                .await
                .map_err(|err| WorkspaceError::FileSystem {
                    path: tree.clone(),
                    err,
                })?;
            unpack(archive.path(), tree).await?;
        }

        let files = list_files(&work).await?;
        debug!("Workspace for {} holds {} files", repo.name, files.len());

        Ok(Workspace {
            _dir: dir,
            work,
            base,
            files,
        })
    }
}

/// A repository materialized at a revision for the duration of one task.
/// The backing directory is removed when the workspace drops, on every
/// exit path.
///
#[derive(Debug)]
pub struct Workspace {
    _dir: tempfile::TempDir,
    work: PathBuf,
    base: PathBuf,
    files: Vec<PathBuf>,
}

impl Workspace {
    /// The tree steps execute against; bind-mounted into containers.
    pub fn work_root(&self) -> &Path {
        &self.work
    }

    /// The untouched tree the final diff is computed against.
    pub fn base_root(&self) -> &Path {
        &self.base
    }

    /// Workspace-relative paths present when the workspace was created.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub async fn snapshot(&self) -> Result<TreeSnapshot, WorkspaceError> {
        TreeSnapshot::capture(&self.work).await
    }
}

/// Collect every file under `root` as a sorted list of relative paths.
pub async fn list_files(root: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut files = vec![];
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut read_dir = fs::read_dir(&dir)
            .await
            .map_err(|err| WorkspaceError::FileSystem {
                path: dir.clone(),
                err,
            })?;

        while let Some(entry) =
            read_dir
                .next_entry()
                .await
                .map_err(|err| WorkspaceError::FileSystem {
                    path: dir.clone(),
                    err,
                })?
        {
            let path = entry.path();
            let file_type =
                entry
                    .file_type()
                    .await
                    .map_err(|err| WorkspaceError::FileSystem {
                        path: path.clone(),
                        err,
                    })?;

            if file_type.is_dir() {
                dirs.push(path);
                continue;
            }

            if let Ok(rel) = path.strip_prefix(root) {
                files.push(rel.to_path_buf());
            }
        }
    }

    files.sort();
    Ok(files)
}

async fn unpack(archive: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    run_extraction(archive, dst)
        .await
        .map_err(|err| WorkspaceError::Extraction {
            src: archive.to_path_buf(),
            dst: dst.to_path_buf(),
            err,
        })
}

/// Extract a zip archive into [dst], falling back to (possibly gzipped)
/// tar when the bytes are not a zip file.
async fn run_extraction(archive: &Path, dst: &Path) -> Result<(), anyhow::Error> {
    let mut file = fs::File::open(&archive).await?;
    match async_zip::read::seek::ZipFileReader::new(&mut file).await {
        Ok(mut zip) => {
            for i in 0..zip.entries().len() {
                let reader = zip.entry_reader(i).await?;

                if reader.entry().dir() {
                    continue;
                }

                let path = dst.join(reader.entry().name());
                fs::create_dir_all(path.parent().unwrap()).await?;

                let mut output = fs::File::create(path).await?;
                reader.copy_to_end_crc(&mut output, 65536).await?;
            }
            Ok(())
        }
        Err(_err) => unpack_tar(archive, dst).await,
    }
}

/// Attempt to unpack [archive] into [dst] by decompressing it first, and
/// if that fails, try without decompression.
async fn unpack_tar(archive: &Path, dst: &Path) -> Result<(), anyhow::Error> {
    let file = fs::File::open(archive).await?;
    let mut decompress_stream = GzipDecoder::new(futures::io::BufReader::new(file.compat()));

    let mut data = vec![];
    if decompress_stream.read_to_end(&mut data).await.is_ok() {
        let mut tar = tar::Archive::new(std::io::BufReader::new(&*data));
        tar.unpack(dst)?
    } else {
        let file = std::fs::File::open(archive)?;
        let mut tar = tar::Archive::new(std::io::BufReader::new(file));
        tar.unpack(dst)?
    }
    Ok(())
}
