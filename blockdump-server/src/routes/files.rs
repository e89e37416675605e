//! Attachment files of dumps, served under the public static base URL.

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{name}/{*path}", get(serve_file))
}

async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path((name, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, AppError> {
    let file = state.manager.store().resolve_file(&name, &path)?;
    match ServeFile::new(file).oneshot(request).await {
        Ok(response) => Ok(response.into_response()),
        Err(never) => match never {},
    }
}
