use crate::config::ClientConfig;
use crate::models::{FIELD_DIR, FIELD_MD5, FIELD_MERGE, UploadResponse};
use crate::utils::hash::calculate_md5;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use url::Url;

/// One file to upload, consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub local_path: PathBuf,
    pub address: Url,
    /// Sent as the `dir` field when set
    pub remote_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Server-side path, when the server reported one
    pub save_path: Option<String>,
    pub bytes: u64,
    pub requests: usize,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{} is not a valid file: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("request to {address} failed: {source}")]
    Request {
        address: Url,
        source: reqwest::Error,
    },

    #[error("{address} answered HTTP {status}")]
    Status {
        address: Url,
        status: reqwest::StatusCode,
    },

    #[error("{address} rejected the upload ({code}): {msg}")]
    Rejected { address: Url, code: u32, msg: String },
}

/// Sends one file to a remote upload endpoint.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn send(&self, task: &UploadTask) -> Result<TransferReceipt, TransferError>;
}

/// `POST` multipart transfer over reqwest.
pub struct HttpTransfer {
    client: reqwest::Client,
    checksum: bool,
    split_size: Option<u64>,
    field_name: String,
}

impl HttpTransfer {
    pub fn new(config: &ClientConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            client,
            checksum: config.checksum,
            split_size: config.split_size,
            field_name: config.field_name.clone(),
        }
    }

    async fn post(
        &self,
        task: &UploadTask,
        filename: &str,
        data: Vec<u8>,
        merge: bool,
    ) -> Result<Option<String>, TransferError> {
        let mut form = Form::new();
        if self.checksum {
            form = form.text(FIELD_MD5, calculate_md5(&data));
        }
        if let Some(dir) = &task.remote_dir {
            form = form.text(FIELD_DIR, dir.clone());
        }
        if merge {
            form = form.text(FIELD_MERGE, "true");
        }
        form = form.part(
            self.field_name.clone(),
            Part::bytes(data).file_name(filename.to_string()),
        );

        let request_error = |source| TransferError::Request {
            address: task.address.clone(),
            source,
        };

        let response = self
            .client
            .post(task.address.clone())
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                address: task.address.clone(),
                status,
            });
        }

        let body = response.bytes().await.map_err(request_error)?;
        match serde_json::from_slice::<UploadResponse>(&body) {
            Ok(reply) if reply.is_success() => Ok(reply.request.map(|r| r.save_path)),
            Ok(reply) => Err(TransferError::Rejected {
                address: task.address.clone(),
                code: reply.code,
                msg: reply.msg,
            }),
            Err(e) => {
                tracing::debug!("Non-JSON upload reply from {}: {}", task.address, e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn send(&self, task: &UploadTask) -> Result<TransferReceipt, TransferError> {
        let read_error = |source| TransferError::Read {
            path: task.local_path.clone(),
            source,
        };

        let filename = task
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let len = tokio::fs::metadata(&task.local_path)
            .await
            .map_err(read_error)?
            .len();

        tracing::info!("upload file: {} -> {}", task.local_path.display(), task.address);

        let chunk_size = match self.split_size {
            Some(chunk_size) if len > chunk_size => chunk_size,
            _ => {
                let data = tokio::fs::read(&task.local_path).await.map_err(read_error)?;
                let bytes = data.len() as u64;
                let save_path = self.post(task, &filename, data, false).await?;
                return Ok(TransferReceipt {
                    save_path,
                    bytes,
                    requests: 1,
                });
            }
        };

        // Sequential chunks: the first replaces, the rest are merged on
        let mut file = tokio::fs::File::open(&task.local_path)
            .await
            .map_err(read_error)?;
        let mut receipt = TransferReceipt::default();
        while receipt.bytes < len {
            let n = chunk_size.min(len - receipt.bytes);
            let mut data = vec![0u8; n as usize];
            file.read_exact(&mut data).await.map_err(read_error)?;

            let merge = receipt.requests > 0;
            receipt.save_path = self.post(task, &filename, data, merge).await?;
            receipt.bytes += n;
            receipt.requests += 1;
            tracing::debug!(
                "Sent chunk {} of {} ({} / {} bytes)",
                receipt.requests,
                task.local_path.display(),
                receipt.bytes,
                len
            );
        }
        Ok(receipt)
    }
}
