use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use blockdump::dump::manifest::Manifest;
use blockdump::store::DumpSummary;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_dumps))
        .route("/{name}", axum::routing::delete(delete_dump))
        .route("/{name}/manifest", get(get_manifest))
}

async fn list_dumps(State(state): State<Arc<AppState>>) -> Result<Json<Vec<DumpSummary>>, AppError> {
    Ok(Json(state.manager.store().list().await?))
}

async fn get_manifest(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Manifest>, AppError> {
    let dump = state.manager.store().open(&name).await?;
    Ok(Json(dump.manifest().await?))
}

async fn delete_dump(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.manager.delete_dump(&name).await?;
    tracing::info!(dump = %name, "Dump deleted");
    Ok(StatusCode::NO_CONTENT)
}
