use crate::AppState;
use crate::models::{FIELD_DIR, FIELD_FILE, FIELD_MD5, FIELD_MERGE, UploadResponse};
use crate::services::storage::StagingError;
use crate::services::upload_service::{UploadError, UploadFile, UploadRequest};
use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartRejection},
    },
};
use std::io;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// The `file` part, spooled to an anonymous temporary file.
struct SpooledFile {
    filename: String,
    size: u64,
    file: Option<tokio::fs::File>,
}

impl SpooledFile {
    fn into_upload(self) -> UploadFile<'static> {
        let source: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match self.file {
            Some(file) => Box::new(file),
            None => Box::new(tokio::io::empty()),
        };
        UploadFile {
            filename: self.filename,
            declared_size: self.size,
            source,
        }
    }
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Multipart, description = "Multipart form: file (required), dir, md5, merge"),
    responses(
        (status = 200, description = "Upload outcome; `code` is 10000 on success", body = UploadResponse)
    ),
    tag = "upload"
)]
pub async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, UploadError> {
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!("Not a multipart request: {}", e);
        UploadError::MissingFile
    })?;

    let policy = state.upload_service.policy();
    let mut request = UploadRequest::default();
    let mut spooled: Option<SpooledFile> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Malformed multipart body: {}", e);
                return Err(match spooled {
                    None => UploadError::MissingFile,
                    // The file part arrived but the rest of the form did not
                    Some(file) => UploadError::Copy(StagingError::Copy {
                        path: file.filename.into(),
                        source: io::Error::other(e),
                    }),
                });
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            FIELD_FILE if spooled.is_none() => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let file = if policy.check_extension(&filename).is_accepted() {
                    spool(field, &filename, policy.max_bytes).await?
                } else {
                    // Rejected by ingest before any byte is read
                    SpooledFile {
                        filename,
                        size: 0,
                        file: None,
                    }
                };
                let oversized = file.size > policy.max_bytes;
                spooled = Some(file);
                if oversized {
                    break;
                }
            }
            FIELD_DIR => request.target_dir = Some(text(field).await?),
            FIELD_MD5 => request.expected_md5 = Some(text(field).await?),
            FIELD_MERGE => request.merge = parse_flag(&text(field).await?),
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    request.file = spooled.map(SpooledFile::into_upload);
    let committed = state.upload_service.ingest(request).await?;

    Ok(Json(UploadResponse::success(
        committed.save_path.display().to_string(),
    )))
}

/// Copies the field into a temporary file, reading at most one byte more
/// than `max_bytes` so oversized uploads are detected without buffering
/// them.
async fn spool(mut field: Field<'_>, filename: &str, max_bytes: u64) -> Result<SpooledFile, UploadError> {
    let std_file = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(io::Error::other)
        .and_then(|r| r)
        .map_err(|source| {
            UploadError::Create(StagingError::CreateFile {
                path: std::env::temp_dir(),
                source,
            })
        })?;
    let mut file = tokio::fs::File::from_std(std_file);
    let copy_error = |source: io::Error| {
        UploadError::Copy(StagingError::Copy {
            path: filename.into(),
            source,
        })
    };

    let mut size: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| copy_error(io::Error::other(e)))?
    {
        size += chunk.len() as u64;
        if size > max_bytes {
            break;
        }
        file.write_all(&chunk).await.map_err(copy_error)?;
    }

    file.flush().await.map_err(copy_error)?;
    file.rewind().await.map_err(copy_error)?;

    Ok(SpooledFile {
        filename: filename.to_string(),
        size,
        file: Some(file),
    })
}

async fn text(field: Field<'_>) -> Result<String, UploadError> {
    field.text().await.map_err(|e| {
        tracing::warn!("Unreadable form field: {}", e);
        UploadError::MissingFile
    })
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
