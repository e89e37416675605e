use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use blockdump::JobKind;
use serde_json::{json, Value};
use std::sync::Arc;

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let manager = &state.manager;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "jobs": {
            "dump": {
                "running": manager.running_count(JobKind::Dump),
                "pending": manager.pending_count(JobKind::Dump),
                "workers": manager.pool_size(JobKind::Dump),
            },
            "migrate": {
                "running": manager.running_count(JobKind::Migrate),
                "pending": manager.pending_count(JobKind::Migrate),
                "workers": manager.pool_size(JobKind::Migrate),
            },
        },
    }))
}
