use crate::models::UploadResponse;
use crate::services::upload_service::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let code = self.code();
        if self.is_rejection() {
            tracing::info!("Upload rejected ({}): {}", code, self);
        } else {
            tracing::error!("Upload failed ({}): {:?}", code, self);
        }

        // Outcomes are reported in the body, never through the HTTP status
        let body = Json(UploadResponse::failure(code, self.to_string()));
        (StatusCode::OK, body).into_response()
    }
}
