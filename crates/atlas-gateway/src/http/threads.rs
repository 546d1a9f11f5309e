use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use atlas_store::{Message, Thread};

use crate::app::AppState;
use crate::http::ApiError;

#[derive(Serialize)]
pub struct ThreadWithMessages {
    pub thread: Thread,
    pub messages: Vec<Message>,
}

pub async fn list_threads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Thread>>, ApiError> {
    Ok(Json(state.store.list_threads()?))
}

pub async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ThreadWithMessages>, ApiError> {
    let thread = state.store.thread(id)?;
    let messages = state.store.list_messages(id)?;
    Ok(Json(ThreadWithMessages { thread, messages }))
}

pub async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.store.delete_thread(id, Utc::now())?;
    Ok((StatusCode::OK, Json(json!({"deleted": id}))))
}
