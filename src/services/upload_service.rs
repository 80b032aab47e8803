use crate::services::storage::{CommitMode, FinalizeError, StagingError, StagingStore};
use crate::utils::validation::{Admission, UploadPolicy};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncRead;

/// The file part of an upload request.
pub struct UploadFile<'a> {
    pub filename: String,
    pub declared_size: u64,
    pub source: Box<dyn AsyncRead + Unpin + Send + 'a>,
}

/// One upload request, as parsed from the multipart form.
#[derive(Default)]
pub struct UploadRequest<'a> {
    pub file: Option<UploadFile<'a>>,
    /// Subdirectory of the save directory (`dir` field)
    pub target_dir: Option<String>,
    /// Hex MD5 of the file bytes (`md5` field)
    pub expected_md5: Option<String>,
    /// Append to an existing file instead of replacing it (`merge` field)
    pub merge: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedUpload {
    pub save_path: PathBuf,
    pub size: u64,
    /// Whether an MD5 was supplied and matched
    pub verified: bool,
    pub merged: bool,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload fail")]
    MissingFile,

    #[error("upload type: {extension} not allow")]
    RejectedExtension { extension: String },

    #[error("upload file size is: {size} than {max_bytes}, please split and merge")]
    RejectedSize { size: u64, max_bytes: u64 },

    #[error("create file failed: {0}")]
    Create(#[source] StagingError),

    #[error("copy file failed: {0}")]
    Copy(#[source] StagingError),

    #[error("{0}")]
    Checksum(#[source] FinalizeError),

    #[error("create file failed: {0}")]
    Promote(#[source] FinalizeError),

    #[error("merge file failed: {0}")]
    Merge(#[source] FinalizeError),
}

impl UploadError {
    /// Stable response code for this outcome.
    pub fn code(&self) -> u32 {
        match self {
            UploadError::MissingFile => 10001,
            UploadError::RejectedExtension { .. } => 10002,
            UploadError::RejectedSize { .. } => 10003,
            UploadError::Create(_) | UploadError::Promote(_) => 10004,
            UploadError::Copy(_) => 10005,
            UploadError::Checksum(_) => 10006,
            UploadError::Merge(_) => 10007,
        }
    }

    /// Admission rejections are input errors; retrying the same request
    /// cannot succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            UploadError::MissingFile
                | UploadError::RejectedExtension { .. }
                | UploadError::RejectedSize { .. }
        )
    }
}

impl From<StagingError> for UploadError {
    fn from(e: StagingError) -> Self {
        match e {
            StagingError::Copy { .. } => UploadError::Copy(e),
            _ => UploadError::Create(e),
        }
    }
}

impl From<FinalizeError> for UploadError {
    fn from(e: FinalizeError) -> Self {
        match e {
            FinalizeError::ChecksumMismatch { .. } | FinalizeError::Checksum(_) => {
                UploadError::Checksum(e)
            }
            FinalizeError::Promote { .. } => UploadError::Promote(e),
            FinalizeError::Merge { .. } => UploadError::Merge(e),
        }
    }
}

/// Runs admission, staging and checksum-gated commit for single uploads.
/// Holds no per-request state, so one instance serves all requests.
pub struct UploadService {
    store: StagingStore,
    policy: UploadPolicy,
}

impl UploadService {
    pub fn new(store: StagingStore, policy: UploadPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    pub async fn ingest(&self, request: UploadRequest<'_>) -> Result<CommittedUpload, UploadError> {
        let UploadRequest {
            file,
            target_dir,
            expected_md5,
            merge,
        } = request;
        let Some(mut file) = file else {
            return Err(UploadError::MissingFile);
        };

        match self.policy.admit(&file.filename, file.declared_size) {
            Admission::Accepted => {}
            Admission::RejectedExtension { extension } => {
                tracing::info!("Rejected {}: extension '{}' not allowed", file.filename, extension);
                return Err(UploadError::RejectedExtension { extension });
            }
            Admission::RejectedSize { size, max_bytes } => {
                tracing::info!(
                    "Rejected {}: {} bytes exceeds {} bytes",
                    file.filename,
                    size,
                    max_bytes
                );
                return Err(UploadError::RejectedSize { size, max_bytes });
            }
        }

        let target_dir = target_dir.as_deref().filter(|d| !d.trim().is_empty());
        let staged = self
            .store
            .stage(&file.filename, target_dir, &mut file.source)
            .await
            .inspect_err(|e| tracing::error!("Staging {} failed: {}", file.filename, e))?;

        let expected = expected_md5.as_deref().filter(|s| !s.trim().is_empty());
        let mode = if merge {
            CommitMode::Merge
        } else {
            CommitMode::Replace
        };
        let final_file = self.store.finalize(staged, expected, mode).await?;

        tracing::info!(
            "Stored {} ({} bytes, md5 {})",
            final_file.path.display(),
            final_file.size,
            if expected.is_some() { "verified" } else { "skipped" }
        );

        Ok(CommittedUpload {
            save_path: final_file.path,
            size: final_file.size,
            verified: expected.is_some(),
            merged: merge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::calculate_md5;
    use crate::utils::validation::AllowedExtensions;
    use std::path::Path;

    fn service(dir: &Path, ext: &str, max_bytes: u64) -> UploadService {
        UploadService::new(
            StagingStore::new(dir),
            UploadPolicy::new(AllowedExtensions::parse(ext), max_bytes),
        )
    }

    fn request<'a>(filename: &str, data: &'a [u8]) -> UploadRequest<'a> {
        UploadRequest {
            file: Some(UploadFile {
                filename: filename.to_string(),
                declared_size: data.len() as u64,
                source: Box::new(data),
            }),
            ..Default::default()
        }
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_accepts_allowed_extension_without_md5() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "pdf|doc", 1024);

        let committed = service.ingest(request("report.pdf", b"%PDF-1.5")).await.unwrap();
        assert!(committed.save_path.ends_with("report.pdf"));
        assert_eq!(committed.size, 8);
        assert!(!committed.verified);
        assert_eq!(listing(dir.path()), vec!["report.pdf"]);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "*", 1024);

        let err = service.ingest(UploadRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), 10001);
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_extension_rejection_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), ".pdf|.doc", 1024);

        let mut req = request("tool.exe", b"MZ");
        req.target_dir = Some("sub".to_string());
        let err = service.ingest(req).await.unwrap_err();

        assert_eq!(err.code(), 10002);
        assert_eq!(err.to_string(), "upload type: .exe not allow");
        assert!(listing(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_extension_rejected_before_size() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), ".pdf", 4);

        let err = service.ingest(request("big.exe", b"0123456789")).await.unwrap_err();
        assert_eq!(err.code(), 10002);

        let err = service.ingest(request("big.pdf", b"0123456789")).await.unwrap_err();
        assert_eq!(err.code(), 10003);
        assert!(listing(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_size_boundary_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "*", 4);

        let committed = service.ingest(request("four.bin", b"1234")).await.unwrap();
        assert_eq!(committed.size, 4);
    }

    #[tokio::test]
    async fn test_matching_md5_commits() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "*", 1024);
        let data = b"verified payload";

        let mut req = request("v.txt", data);
        req.expected_md5 = Some(calculate_md5(data));
        let committed = service.ingest(req).await.unwrap();

        assert!(committed.verified);
        assert_eq!(std::fs::read(committed.save_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_wrong_md5_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "*", 1024);

        let mut req = request("report.pdf", b"%PDF-1.5");
        req.expected_md5 = Some("00000000000000000000000000000000".to_string());
        let err = service.ingest(req).await.unwrap_err();

        assert_eq!(err.code(), 10006);
        assert_eq!(err.to_string(), "file md5 verification fails");
        assert!(listing(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_blank_md5_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "*", 1024);

        let mut req = request("a.txt", b"abc");
        req.expected_md5 = Some("  ".to_string());
        let committed = service.ingest(req).await.unwrap();
        assert!(!committed.verified);
    }

    #[tokio::test]
    async fn test_target_dir_is_confined() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "*", 1024);

        let mut req = request("a.txt", b"abc");
        req.target_dir = Some("../../tmp".to_string());
        let err = service.ingest(req).await.unwrap_err();
        assert_eq!(err.code(), 10004);
        assert!(!err.is_rejection());

        let mut req = request("a.txt", b"abc");
        req.target_dir = Some("reports/2024".to_string());
        let committed = service.ingest(req).await.unwrap();
        assert_eq!(committed.save_path, dir.path().join("reports/2024/a.txt"));
    }

    #[tokio::test]
    async fn test_merge_appends() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), "*", 1024);

        service.ingest(request("joined.bin", b"abc")).await.unwrap();
        let mut req = request("joined.bin", b"def");
        req.merge = true;
        let committed = service.ingest(req).await.unwrap();

        assert!(committed.merged);
        assert_eq!(committed.size, 6);
        assert_eq!(std::fs::read(committed.save_path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_error_codes() {
        let copy = UploadError::from(StagingError::Copy {
            path: PathBuf::from("x"),
            source: std::io::Error::other("boom"),
        });
        assert_eq!(copy.code(), 10005);

        let merge = UploadError::from(FinalizeError::Merge {
            path: PathBuf::from("x"),
            source: std::io::Error::other("boom"),
        });
        assert_eq!(merge.code(), 10007);

        let size = UploadError::RejectedSize {
            size: 10,
            max_bytes: 4,
        };
        assert_eq!(size.code(), 10003);
        assert_eq!(
            size.to_string(),
            "upload file size is: 10 than 4, please split and merge"
        );
    }
}
