pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::MIB;
use crate::services::upload_service::UploadService;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::ServeDir;
use utoipa::OpenApi;

/// Room for multipart framing and the text fields on top of the file itself.
pub const MULTIPART_OVERHEAD: u64 = MIB;

/// Every route `create_app` registers, as reported by `/help`.
pub const ROUTES: &[(&str, &str)] = &[
    ("GET", "/running"),
    ("GET", "/help"),
    ("GET", "/api-docs/openapi.json"),
    ("GET", "/list/*filepath"),
    ("HEAD", "/list/*filepath"),
    ("POST", "/upload"),
];

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::system::running,
        api::handlers::system::help,
        api::handlers::upload::upload_file,
    ),
    components(
        schemas(
            models::UploadResponse,
            models::SavedFile,
        )
    ),
    tags(
        (name = "upload", description = "File upload endpoint"),
        (name = "system", description = "Liveness and route discovery")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub upload_service: Arc<UploadService>,
}

impl AppState {
    pub fn new(upload_service: Arc<UploadService>) -> Self {
        Self { upload_service }
    }
}

pub fn create_app(state: AppState) -> Router {
    let save_dir = state.upload_service.store().save_dir().to_path_buf();
    let body_limit = state
        .upload_service
        .policy()
        .max_bytes
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/running", get(api::handlers::system::running))
        .route("/help", get(api::handlers::system::help))
        .route("/api-docs/openapi.json", get(api::handlers::system::openapi))
        .route("/upload", post(api::handlers::upload::upload_file))
        .nest_service("/list", ServeDir::new(save_dir))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
