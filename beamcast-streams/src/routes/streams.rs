use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use beamcast_shared::errors::{AppError, AppResult};
use beamcast_shared::types::ApiResponse;

use crate::models::{
    JoinerType, NewStream, NewStreamJoiner, Stream, StreamJoiner, StreamStatus, StreamWithJoiners,
};
use crate::services::stream_store::stream_not_found;
use crate::AppState;

fn validate(req: &impl Validate) -> AppResult<()> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))
}

// --- GET /api/streams ---

pub async fn list_streams(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<Vec<StreamWithJoiners>>>> {
    let streams = state.store.list_streams()?;
    Ok(Json(ApiResponse::ok(streams)))
}

// --- GET /api/streams/:id ---

pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> AppResult<Json<ApiResponse<Stream>>> {
    let stream = state.store.get_stream(id)?;
    Ok(Json(ApiResponse::ok(stream)))
}

// --- POST /api/streams ---

#[derive(Debug, Deserialize, Validate)]
pub struct CreateStreamRequest {
    #[validate(
        required(message = "title is required"),
        length(max = 255, message = "title must be at most 255 characters")
    )]
    pub title: Option<String>,
    #[validate(length(max = 255, message = "path must be at most 255 characters"))]
    pub path: Option<String>,
    pub status: Option<String>,
}

pub async fn create_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateStreamRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<Stream>>)> {
    validate(&req)?;

    let title = req.title.as_deref().unwrap_or_default().trim();
    if title.is_empty() {
        return Err(AppError::Validation("title is required".into()));
    }

    let status = match req.status.as_deref() {
        Some(s) => StreamStatus::parse(s)?,
        None => StreamStatus::Pending,
    };

    let stream = state.store.create_stream(NewStream {
        title: title.to_string(),
        path: req.path,
        status: status.as_str().to_string(),
    })?;

    counter!("streams_created_total").increment(1);
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(stream))))
}

// --- PATCH /api/streams/:id/status ---

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateStatusRequest {
    #[validate(required(message = "missing status in request body"))]
    pub status: Option<String>,
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<UpdateStatusRequest>,
) -> AppResult<Json<ApiResponse<Stream>>> {
    validate(&req)?;
    let next = StreamStatus::parse(req.status.as_deref().unwrap_or_default())?;

    let change = state
        .store
        .set_status(id, next)?
        .ok_or_else(|| stream_not_found(id))?;

    tracing::info!(stream_id = id, from = change.from.as_str(), to = next.as_str(), "stream status changed");
    Ok(Json(ApiResponse::ok(change.stream)))
}

// --- PATCH /api/streams/:id/joiners ---

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddJoinerRequest {
    #[validate(required(message = "missing joinerType"))]
    pub joiner_type: Option<String>,
    #[validate(
        required(message = "missing userEmail"),
        email(message = "invalid email format")
    )]
    pub user_email: Option<String>,
}

pub async fn add_joiner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<AddJoinerRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<StreamJoiner>>)> {
    validate(&req)?;
    let joiner_type = JoinerType::parse(req.joiner_type.as_deref().unwrap_or_default())?;
    let user_email = req.user_email.unwrap_or_default().to_lowercase();

    let joiner = state
        .store
        .add_joiner(NewStreamJoiner {
            stream_id: id,
            joiner_type: joiner_type.as_str().to_string(),
            user_email,
        })?
        .ok_or_else(|| stream_not_found(id))?;

    tracing::info!(stream_id = id, joiner_type = joiner_type.as_str(), "joiner added");
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(joiner))))
}
