use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream;
use sandbox_core::{ExecutionJob, OutputChunk, SandboxRecord};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ManagerError;
use crate::gateway::Gateway;
use crate::governor::Governor;
use crate::lifecycle::Controller;
use crate::registry::Registry;

/// Routes that finish quickly get a uniform request timeout; the output
/// stream is exempt because the handler returns headers immediately.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub governor: Arc<Governor>,
    pub controller: Arc<Controller>,
    pub gateway: Arc<Gateway>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route("/sandboxes/{id}", get(get_sandbox).delete(delete_sandbox))
        .route("/sandboxes/{id}/heartbeat", post(heartbeat))
        .route("/sandboxes/{id}/jobs", post(submit_job).get(list_jobs))
        .route("/sandboxes/{id}/files", post(upload_file))
        .route("/sandboxes/{id}/files/{*path}", get(download_file))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/output", get(job_output))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .with_state(state)
}

enum ApiError {
    Manager(ManagerError),
    BadRequest(String),
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        Self::Manager(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Manager(e) => {
                let status = match &e {
                    ManagerError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
                    ManagerError::Provision(_) => StatusCode::BAD_GATEWAY,
                    ManagerError::SandboxNotAvailable(_)
                    | ManagerError::InvalidTransition { .. }
                    | ManagerError::AlreadyTerminal
                    | ManagerError::NotTerminal => StatusCode::CONFLICT,
                    ManagerError::NotFound => StatusCode::NOT_FOUND,
                    ManagerError::StreamConsumed => StatusCode::GONE,
                    ManagerError::Config(_)
                    | ManagerError::Runtime(_)
                    | ManagerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Sandboxes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateSandboxRequest {
    owner: String,
    image: Option<String>,
    cpu_milli: Option<u32>,
    memory_mb: Option<u32>,
    timeout_secs: Option<u64>,
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(req): Json<CreateSandboxRequest>,
) -> ApiResult<(StatusCode, Json<SandboxRecord>)> {
    if req.owner.trim().is_empty() {
        return Err(ApiError::BadRequest("owner must not be empty".into()));
    }
    let limits = state
        .config
        .resolve_limits(req.cpu_milli, req.memory_mb, req.timeout_secs);
    let record = state
        .controller
        .provision(&req.owner, req.image, limits)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_sandboxes(State(state): State<AppState>) -> Json<Vec<SandboxRecord>> {
    Json(state.registry.list_active())
}

async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SandboxRecord>> {
    let record = state.registry.find(id).ok_or(ManagerError::NotFound)?;
    Ok(Json(record))
}

async fn delete_sandbox(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.controller.teardown(id).await?;
    Ok(Json(json!({ "id": id, "status": "terminated" })))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.controller.heartbeat(id).await?;
    Ok(Json(json!({ "id": id, "status": "ok" })))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubmitJobRequest {
    command: Vec<String>,
    timeout_secs: Option<u64>,
}

async fn submit_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<ExecutionJob>)> {
    if req.command.is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".into()));
    }
    let timeout = req.timeout_secs.map(Duration::from_secs);
    let job = state.gateway.submit(id, req.command, timeout).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ExecutionJob>>> {
    // 404 for unknown sandboxes rather than an empty list.
    state.registry.find(id).ok_or(ManagerError::NotFound)?;
    Ok(Json(state.gateway.jobs_for_sandbox(id)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionJob>> {
    Ok(Json(state.gateway.status(id)?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.gateway.cancel(id)?;
    Ok(Json(json!({ "id": id, "status": "cancelling" })))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.gateway.cleanup(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream job output as NDJSON: one line per chunk, then a final
/// `{"event":"exit",...}` line once the job settles. The stream is finite
/// and can be consumed once per job.
async fn job_output(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let rx = state.gateway.stream_output(id)?;
    let gateway = Arc::clone(&state.gateway);

    let stream = stream::unfold(OutputPhase::Chunks(rx), move |phase| {
        let gateway = Arc::clone(&gateway);
        async move {
            match phase {
                OutputPhase::Chunks(mut rx) => match rx.recv().await {
                    Some(chunk) => Some((
                        Ok::<_, Infallible>(chunk_line(&chunk)),
                        OutputPhase::Chunks(rx),
                    )),
                    None => Some((Ok(exit_line(&gateway, id).await), OutputPhase::Done)),
                },
                OutputPhase::Done => None,
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}

enum OutputPhase {
    Chunks(mpsc::Receiver<OutputChunk>),
    Done,
}

fn chunk_line(chunk: &OutputChunk) -> String {
    let line = json!({
        "stream": chunk.kind,
        "data_b64": BASE64.encode(&chunk.data),
    });
    format!("{line}\n")
}

/// The output channel closes slightly before the watcher records the
/// outcome, so poll briefly for the settled job.
async fn exit_line(gateway: &Gateway, job_id: Uuid) -> String {
    for _ in 0..100 {
        match gateway.status(job_id) {
            Ok(job) => {
                if let Some(outcome) = job.outcome {
                    let line = json!({ "event": "exit", "outcome": outcome });
                    return format!("{line}\n");
                }
            }
            Err(_) => break,
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    format!("{}\n", json!({ "event": "exit" }))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct UploadFileRequest {
    path: String,
    content_b64: String,
    /// Octal permission string, e.g. "644".
    mode: Option<String>,
}

async fn upload_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UploadFileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let content = BASE64
        .decode(req.content_b64.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("invalid base64 content: {e}")))?;
    let mode = req
        .mode
        .as_deref()
        .map(|raw| {
            u32::from_str_radix(raw, 8)
                .map_err(|_| ApiError::BadRequest(format!("invalid file mode {raw:?}")))
        })
        .transpose()?;
    state
        .controller
        .write_file(id, &req.path, &content, mode)
        .await?;
    Ok(Json(json!({ "path": req.path, "bytes": content.len() })))
}

async fn download_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(Uuid, String)>,
) -> ApiResult<Response> {
    // The wildcard segment arrives without a leading slash; container
    // paths are absolute.
    let absolute = format!("/{path}");
    let content = state.controller.read_file(id, &absolute).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.governor.snapshot();
    Json(json!({
        "status": "ok",
        "active": snapshot.live,
        "max_containers": state.config.max_containers,
    }))
}
