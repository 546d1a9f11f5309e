use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use atlas_core::Error;
use atlas_store::MemoryEntry;

use crate::app::AppState;
use crate::http::ApiError;

pub async fn list_memories(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MemoryEntry>>, ApiError> {
    Ok(Json(state.memory.list()?))
}

#[derive(Deserialize)]
pub struct UpdateMemoryBody {
    pub content: String,
}

pub async fn update_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateMemoryBody>,
) -> Result<Json<MemoryEntry>, ApiError> {
    if body.content.trim().is_empty() {
        return Err(Error::validation("memory content must not be empty").into());
    }
    let entry = state.memory.update(id, body.content.trim()).await?;
    Ok(Json(entry))
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.memory.delete(id)?;
    Ok((StatusCode::OK, Json(json!({"deleted": id}))))
}
