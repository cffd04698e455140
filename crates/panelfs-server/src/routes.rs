//! Route table and handlers.

use axum::body::{Body, Bytes};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use panelfs_core::{TaskFilter, TaskId, TaskKind, TaskPayload, TaskRecord};
use panelfs_ops::{check_conflicts, ConflictReport};
use panelfs_upload::{
    BeginUpload, ConflictCheckRequest, FinalizeRequest, FinalizeResponse, SessionInfo,
    UploadStatus, CHUNK_CHECKSUM_HEADER,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ApiError, Result};
use crate::state::AppState;

/// Largest chunk body accepted.
pub const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    task_id: TaskId,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

/// Build the `/api` router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/content", get(task_content))
        .route("/uploads", post(begin_upload))
        .route("/uploads/conflicts", post(upload_conflicts))
        .route("/uploads/{file_id}", get(upload_status).delete(cancel_upload))
        .route(
            "/uploads/{file_id}/chunks/{index}",
            put(put_chunk).layer(DefaultBodyLimit::max(MAX_CHUNK_BYTES as usize)),
        )
        .route("/uploads/{file_id}/finalize", post(finalize_upload));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_id(raw: &str) -> Result<TaskId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid task id: {raw}")))
}

async fn create_task(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(request) = body?;
    let kind = TaskKind::parse(&request.kind)?;
    let payload: TaskPayload = serde_json::from_value(json!({
        "type": kind,
        "payload": request.payload,
    }))
    .map_err(|e| ApiError::BadRequest(format!("invalid {kind} payload: {e}")))?;

    let task_id = state.engine.submit(kind, payload).await?;
    info!(task_id = %task_id, %kind, "task created");
    Ok((StatusCode::ACCEPTED, Json(CreateTaskResponse { task_id })))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskRecord>> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry().get(id)?))
}

async fn list_tasks(
    State(state): State<AppState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<TaskRecord>>> {
    let Query(query) = query?;
    let filter = match query.status.as_deref() {
        Some(statuses) => statuses.parse::<TaskFilter>()?,
        None => TaskFilter::all(),
    };
    Ok(Json(state.registry().list(&filter)))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    let id = parse_id(&id)?;
    state.registry().delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let id = parse_id(&id)?;
    let cancelled = state.engine.cancel(id)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn task_content(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let id = parse_id(&id)?;
    let stream = state.engine.open_download(id).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(stream.size()));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&stream.file_name())) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((headers, Body::from_stream(stream)).into_response())
}

/// `attachment` disposition with a header-safe file name.
fn content_disposition(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

async fn upload_conflicts(
    body: std::result::Result<Json<ConflictCheckRequest>, JsonRejection>,
) -> Result<Json<ConflictReport>> {
    let Json(request) = body?;
    Ok(Json(check_conflicts(&request.target_path, &request.file_names).await?))
}

async fn begin_upload(
    State(state): State<AppState>,
    body: std::result::Result<Json<BeginUpload>, JsonRejection>,
) -> Result<Json<SessionInfo>> {
    let Json(request) = body?;
    if request.chunk_size > MAX_CHUNK_BYTES {
        return Err(ApiError::BadRequest(format!(
            "chunk size {} exceeds the {MAX_CHUNK_BYTES} byte limit",
            request.chunk_size
        )));
    }
    Ok(Json(state.uploads.begin(&request).await?))
}

async fn put_chunk(
    State(state): State<AppState>,
    Path((file_id, index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let checksum = headers
        .get(CHUNK_CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok());
    state.uploads.put_chunk(&file_id, index, body, checksum).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn finalize_upload(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    body: std::result::Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Json<FinalizeResponse>> {
    let Json(request) = body?;
    let path = state
        .uploads
        .finalize(&file_id, request.conflict_strategy)
        .await?;
    Ok(Json(FinalizeResponse { path }))
}

async fn upload_status(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<UploadStatus>> {
    Ok(Json(state.uploads.status(&file_id)?))
}

async fn cancel_upload(State(state): State<AppState>, Path(file_id): Path<String>) -> Result<StatusCode> {
    state.uploads.cancel(&file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
