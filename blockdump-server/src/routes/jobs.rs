use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use blockdump::history::HistoryStats;
use blockdump::{Job, JobKind, JobState};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_HISTORY_DAYS: u32 = 7;
const MAX_HISTORY_DAYS: u32 = 90;
const DEFAULT_STATISTICS_DAYS: u32 = 30;
const MAX_STATISTICS_DAYS: u32 = 365;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/dump", post(submit_dump))
        .route("/migrate", post(submit_migrate))
        .route("/history", get(recent_history))
        .route("/history/dates", get(history_dates))
        .route("/history/range", get(history_range))
        .route("/history/{date}", get(history_day))
        .route("/statistics", get(statistics))
        .route("/{id}", get(get_job).delete(remove_job))
        .route("/{id}/cancel", post(cancel_job))
}

#[derive(Deserialize)]
pub struct DumpRequest {
    pub page_id: String,
}

#[derive(Deserialize)]
pub struct MigrateRequest {
    pub dump_name: String,
    pub target_page_id: String,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub days: Option<u32>,
}

#[derive(Deserialize)]
pub struct RangeQuery {
    pub start: String,
    pub end: String,
    pub kind: Option<JobKind>,
    pub state: Option<JobState>,
}

fn parse_day(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("Invalid date: {raw}")))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.manager.list())
}

async fn submit_dump(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DumpRequest>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let job = state.manager.submit_dump(&body.page_id).await?;
    tracing::info!(job_id = %job.id, "Dump requested");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn submit_migrate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MigrateRequest>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let job = state
        .manager
        .submit_migrate(&body.dump_name, &body.target_page_id)
        .await?;
    tracing::info!(job_id = %job.id, dump = %body.dump_name, "Migration requested");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    state
        .manager
        .get(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Job not found".into()))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.manager.cancel(id)?))
}

async fn remove_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.manager.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recent_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Job>>, AppError> {
    let Some(history) = state.manager.history() else {
        return Ok(Json(Vec::new()));
    };
    let days = query
        .days
        .unwrap_or(DEFAULT_HISTORY_DAYS)
        .clamp(1, MAX_HISTORY_DAYS);
    Ok(Json(history.recent(days).await?))
}

async fn history_day(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Result<Json<Vec<Job>>, AppError> {
    let day = parse_day(&date)?;
    let Some(history) = state.manager.history() else {
        return Ok(Json(Vec::new()));
    };
    Ok(Json(history.read_day(day).await?))
}

async fn history_dates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<NaiveDate>>, AppError> {
    let Some(history) = state.manager.history() else {
        return Ok(Json(Vec::new()));
    };
    Ok(Json(history.available_dates().await?))
}

async fn history_range(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<BTreeMap<NaiveDate, Vec<Job>>>, AppError> {
    let start = parse_day(&query.start)?;
    let end = parse_day(&query.end)?;
    let Some(history) = state.manager.history() else {
        return Ok(Json(BTreeMap::new()));
    };
    Ok(Json(history.range(start, end, query.kind, query.state).await?))
}

async fn statistics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryStats>, AppError> {
    let days = query.days.unwrap_or(DEFAULT_STATISTICS_DAYS);
    if !(1..=MAX_STATISTICS_DAYS).contains(&days) {
        return Err(AppError::BadRequest(format!(
            "days must be between 1 and {MAX_STATISTICS_DAYS}"
        )));
    }
    let Some(history) = state.manager.history() else {
        return Ok(Json(HistoryStats {
            days,
            ..HistoryStats::default()
        }));
    };
    Ok(Json(history.statistics(days).await?))
}
