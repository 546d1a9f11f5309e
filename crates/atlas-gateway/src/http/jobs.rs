use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use atlas_scheduler::{JobSpec, JobUpdate};
use atlas_store::{Job, JobRun};

use crate::app::AppState;
use crate::http::ApiError;

#[derive(Serialize)]
pub struct JobWithRuns {
    pub job: Job,
    /// Run history, most recent first.
    pub runs: Vec<JobRun>,
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.jobs.create(spec)?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.jobs.list()?))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<JobWithRuns>, ApiError> {
    let (job, runs) = state.jobs.get_with_runs(id)?;
    Ok(Json(JobWithRuns { job, runs }))
}

pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(update): Json<JobUpdate>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.update(id, update)?))
}

pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.jobs.delete(id)?;
    Ok((StatusCode::OK, Json(json!({"deleted": id}))))
}
