use crate::{ApiDoc, ROUTES};
use axum::{Json, response::IntoResponse};
use std::collections::BTreeMap;
use utoipa::OpenApi;

#[utoipa::path(
    get,
    path = "/running",
    responses(
        (status = 200, description = "Server is up", body = String)
    ),
    tag = "system"
)]
pub async fn running() -> impl IntoResponse {
    Json("running")
}

#[utoipa::path(
    get,
    path = "/help",
    responses(
        (status = 200, description = "Registered paths grouped by HTTP method")
    ),
    tag = "system"
)]
pub async fn help() -> impl IntoResponse {
    Json(route_map())
}

pub async fn openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// Every registered route except `/help` itself, keyed by method.
pub fn route_map() -> BTreeMap<&'static str, Vec<&'static str>> {
    let mut routes: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
    for (method, path) in ROUTES {
        if path.eq_ignore_ascii_case("/help") {
            continue;
        }
        routes.entry(*method).or_default().push(*path);
    }
    routes
}
