use crate::utils::hash::{calculate_md5_of_file, digest_matches};
use crate::utils::validation::{PathError, confine_subdir, sanitize_filename};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

/// Bytes of one upload, written to a hidden sibling of its destination.
#[derive(Debug)]
pub struct StagedFile {
    pub temp_path: PathBuf,
    pub final_path: PathBuf,
    pub bytes_written: u64,
}

/// An upload that has been committed under the save directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalFile {
    pub path: PathBuf,
    pub size: u64,
}

/// How a verified staged file is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Atomically replace whatever is at the final path.
    #[default]
    Replace,
    /// Append to the file at the final path, creating it if missing.
    Merge,
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("invalid destination: {0}")]
    InvalidPath(#[from] PathError),

    #[error("create directory {} failed: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("create file {} failed: {source}", .path.display())]
    CreateFile { path: PathBuf, source: io::Error },

    #[error("copy file failed: {source}")]
    Copy { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(
        "file md5 verification fails{}",
        .cleanup.as_ref().map(|e| format!(" {}", e)).unwrap_or_default()
    )]
    ChecksumMismatch {
        expected: String,
        actual: String,
        /// Set when removing the staged file failed as well.
        cleanup: Option<io::Error>,
    },

    #[error("md5 calculation failed: {0}")]
    Checksum(#[source] io::Error),

    #[error("promote to {} failed: {source}", .path.display())]
    Promote { path: PathBuf, source: io::Error },

    #[error("merge into {} failed: {source}", .path.display())]
    Merge { path: PathBuf, source: io::Error },
}

/// Temporary-file lifecycle for uploads under one save directory.
#[derive(Debug, Clone)]
pub struct StagingStore {
    save_dir: PathBuf,
}

impl StagingStore {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Destination of `filename`, optionally nested under `subdir`. The
    /// result always lies inside the save directory.
    pub fn resolve(&self, filename: &str, subdir: Option<&str>) -> Result<PathBuf, StagingError> {
        let name = sanitize_filename(filename)?;
        let mut path = self.save_dir.clone();
        if let Some(subdir) = subdir {
            path.push(confine_subdir(subdir)?);
        }
        path.push(name);
        Ok(path)
    }

    /// Copies `reader` into a new staging file next to the destination.
    /// Nothing is left behind on failure.
    pub async fn stage<R>(
        &self,
        filename: &str,
        subdir: Option<&str>,
        reader: &mut R,
    ) -> Result<StagedFile, StagingError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let final_path = self.resolve(filename, subdir)?;
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.save_dir.clone());

        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StagingError::CreateDir {
                path: dir.clone(),
                source,
            })?;

        let temp_path = dir.join(format!(".thor-{}.part", Uuid::new_v4().simple()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|source| StagingError::CreateFile {
                path: temp_path.clone(),
                source,
            })?;

        let copied = async {
            let n = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            file.sync_data().await?;
            Ok::<u64, io::Error>(n)
        }
        .await;
        drop(file);

        match copied {
            Ok(bytes_written) => {
                tracing::debug!(
                    "Staged {} bytes for {} at {}",
                    bytes_written,
                    final_path.display(),
                    temp_path.display()
                );
                Ok(StagedFile {
                    temp_path,
                    final_path,
                    bytes_written,
                })
            }
            Err(source) => {
                if let Err(e) = fs::remove_file(&temp_path).await {
                    tracing::error!(
                        "Failed to remove partial staging file {}: {}",
                        temp_path.display(),
                        e
                    );
                }
                Err(StagingError::Copy {
                    path: final_path,
                    source,
                })
            }
        }
    }

    /// Verifies the staged bytes against `expected_md5` (when given) and
    /// commits them. A mismatch always removes the staged file.
    pub async fn finalize(
        &self,
        staged: StagedFile,
        expected_md5: Option<&str>,
        mode: CommitMode,
    ) -> Result<FinalFile, FinalizeError> {
        if let Some(expected) = expected_md5.filter(|s| !s.trim().is_empty()) {
            let actual = match calculate_md5_of_file(&staged.temp_path).await {
                Ok(actual) => actual,
                Err(e) => {
                    self.discard(&staged).await;
                    return Err(FinalizeError::Checksum(e));
                }
            };

            if !digest_matches(expected, &actual) {
                tracing::warn!(
                    "MD5 mismatch for {}: expected {}, got {}",
                    staged.final_path.display(),
                    expected,
                    actual
                );
                let cleanup = fs::remove_file(&staged.temp_path).await.err();
                return Err(FinalizeError::ChecksumMismatch {
                    expected: expected.trim().to_string(),
                    actual,
                    cleanup,
                });
            }
        }

        match mode {
            CommitMode::Replace => self.promote(staged).await,
            CommitMode::Merge => self.merge(staged).await,
        }
    }

    /// Best-effort removal of a staged file that will not be committed.
    pub async fn discard(&self, staged: &StagedFile) {
        if let Err(e) = fs::remove_file(&staged.temp_path).await {
            tracing::error!(
                "Failed to remove staging file {}: {}",
                staged.temp_path.display(),
                e
            );
        }
    }

    async fn promote(&self, staged: StagedFile) -> Result<FinalFile, FinalizeError> {
        if let Err(source) = fs::rename(&staged.temp_path, &staged.final_path).await {
            self.discard(&staged).await;
            return Err(FinalizeError::Promote {
                path: staged.final_path,
                source,
            });
        }

        Ok(FinalFile {
            path: staged.final_path,
            size: staged.bytes_written,
        })
    }

    async fn merge(&self, staged: StagedFile) -> Result<FinalFile, FinalizeError> {
        let result = append_file(&staged.temp_path, &staged.final_path).await;
        self.discard(&staged).await;

        match result {
            Ok(size) => Ok(FinalFile {
                path: staged.final_path,
                size,
            }),
            Err(source) => Err(FinalizeError::Merge {
                path: staged.final_path,
                source,
            }),
        }
    }
}

/// Appends `src` onto `dst` and returns the new length of `dst`. On error
/// `dst` is truncated back to its previous length.
async fn append_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut source = fs::File::open(src).await?;
    let mut target = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dst)
        .await?;
    let original_len = target.metadata().await?.len();

    let appended = async {
        let n = tokio::io::copy(&mut source, &mut target).await?;
        target.flush().await?;
        target.sync_data().await?;
        Ok::<u64, io::Error>(n)
    }
    .await;

    match appended {
        Ok(n) => Ok(original_len + n),
        Err(e) => {
            if let Err(truncate_err) = target.set_len(original_len).await {
                tracing::error!(
                    "Failed to roll back partial merge of {}: {}",
                    dst.display(),
                    truncate_err
                );
            }
            Err(e)
        }
    }
}
