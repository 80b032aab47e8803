use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Multipart field carrying the file bytes.
pub const FIELD_FILE: &str = "file";
/// Optional subdirectory of the save directory.
pub const FIELD_DIR: &str = "dir";
/// Optional hex MD5 of the file bytes.
pub const FIELD_MD5: &str = "md5";
/// Optional flag: append to the stored file instead of replacing it.
pub const FIELD_MERGE: &str = "merge";

/// Envelope returned by `POST /upload`. The HTTP status is always 200;
/// `code` carries the outcome.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<SavedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SavedFile {
    pub save_path: String,
}

impl UploadResponse {
    pub const SUCCESS: u32 = 10000;

    pub fn success(save_path: String) -> Self {
        Self {
            code: Self::SUCCESS,
            msg: "upload success".to_string(),
            request: Some(SavedFile { save_path }),
        }
    }

    pub fn failure(code: u32, msg: String) -> Self {
        Self {
            code,
            msg,
            request: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }
}
