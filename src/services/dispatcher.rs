use crate::config::ClientConfig;
use crate::services::transfer::{Transfer, TransferError, TransferReceipt, UploadTask};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use url::Url;
use walkdir::WalkDir;

/// Counters for one dispatcher run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, joined: Result<(UploadTask, Result<TransferReceipt, TransferError>), JoinError>) {
        match joined {
            Ok((task, Ok(receipt))) => {
                self.succeeded += 1;
                tracing::info!(
                    path = %task.local_path.display(),
                    address = %task.address,
                    save_path = receipt.save_path.as_deref().unwrap_or("-"),
                    bytes = receipt.bytes,
                    "Uploaded file"
                );
            }
            Ok((task, Err(e))) => {
                self.failed += 1;
                tracing::warn!(
                    path = %task.local_path.display(),
                    address = %task.address,
                    "Upload failed: {}",
                    e
                );
            }
            Err(e) => {
                self.failed += 1;
                tracing::error!("Upload worker aborted: {}", e);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{} does not exist", .0.display())]
    MissingRoot(PathBuf),

    #[error("file enumeration failed: {0}")]
    Enumeration(#[from] JoinError),
}

/// Walks `root` and hands every non-directory entry to `emit`, in file name
/// order. Stops early when `emit` returns false. Returns the number emitted.
pub fn enumerate_with<F>(root: &Path, address: &Url, preserve_tree: bool, mut emit: F) -> usize
where
    F: FnMut(UploadTask) -> bool,
{
    let mut emitted = 0;
    // Symlinks are not followed; each one is a single upload attempt
    for entry in WalkDir::new(root).sort_by_file_name() {
        let path = match entry {
            Ok(entry) if entry.file_type().is_dir() => continue,
            Ok(entry) => entry.into_path(),
            // Unreadable or dangling entries still become tasks so they fail
            // and get counted like any other transfer failure.
            Err(e) => match e.path() {
                Some(path) => {
                    tracing::debug!("Walk error: {}", e);
                    path.to_path_buf()
                }
                None => {
                    tracing::warn!("Walk error: {}", e);
                    continue;
                }
            },
        };

        let remote_dir = if preserve_tree {
            relative_dir(root, &path)
        } else {
            None
        };
        let task = UploadTask {
            local_path: path,
            address: address.clone(),
            remote_dir,
        };
        if !emit(task) {
            break;
        }
        emitted += 1;
    }
    emitted
}

/// Collects every upload task under `root`.
pub fn enumerate(root: &Path, address: &Url, preserve_tree: bool) -> Vec<UploadTask> {
    let mut tasks = Vec::new();
    enumerate_with(root, address, preserve_tree, |task| {
        tasks.push(task);
        true
    });
    tasks
}

fn relative_dir(root: &Path, path: &Path) -> Option<String> {
    let parent = path.parent()?.strip_prefix(root).ok()?;
    let parts: Vec<String> = parent
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Runs a bounded pool of transfers over every file under a root path.
pub struct UploadDispatcher {
    transfer: Arc<dyn Transfer>,
    concurrency: usize,
    preserve_tree: bool,
}

impl UploadDispatcher {
    pub fn new(transfer: Arc<dyn Transfer>, config: &ClientConfig) -> Self {
        Self {
            transfer,
            concurrency: config.concurrency.max(1),
            preserve_tree: config.preserve_tree,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Uploads every file under `root`. Per-file failures are logged and
    /// counted; they never stop the run.
    pub async fn run(&self, root: &Path, address: &Url) -> Result<RunOutcome, DispatchError> {
        if tokio::fs::symlink_metadata(root).await.is_err() {
            return Err(DispatchError::MissingRoot(root.to_path_buf()));
        }

        let (tx, mut rx) = mpsc::channel::<UploadTask>(self.concurrency * 2);
        let producer = {
            let root = root.to_path_buf();
            let address = address.clone();
            let preserve_tree = self.preserve_tree;
            tokio::task::spawn_blocking(move || {
                enumerate_with(&root, &address, preserve_tree, |task| {
                    tx.blocking_send(task).is_ok()
                })
            })
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut outcome = RunOutcome::default();

        while let Some(task) = rx.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            outcome.attempted += 1;

            let transfer = Arc::clone(&self.transfer);
            workers.spawn(async move {
                let _permit = permit;
                let result = transfer.send(&task).await;
                (task, result)
            });

            while let Some(joined) = workers.try_join_next() {
                outcome.record(joined);
            }
        }

        let emitted = producer.await?;
        while let Some(joined) = workers.join_next().await {
            outcome.record(joined);
        }

        tracing::info!(
            "Upload run finished: {} files found, {} attempted, {} succeeded, {} failed",
            emitted,
            outcome.attempted,
            outcome.succeeded,
            outcome.failed
        );
        Ok(outcome)
    }
}
