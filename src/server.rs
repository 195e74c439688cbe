//! HTTP server exposing a [`LocalRuntime`] to remote clients.
//!
//! This is what the `swerex-remote` binary serves from inside a container.
//! Every endpoint is a thin translation between JSON bodies and the runtime
//! operations; per-request failures stay inside the response envelopes, and
//! anything the runtime *raises* is transferred to the client as an HTTP 511
//! body carrying `{class_path, message, traceback}` so the client can rebuild
//! the typed error. When an auth token is configured, a middleware rejects
//! requests whose `X-API-Key` header does not match.

use crate::error::{ExceptionEnvelope, ExceptionTransfer, RexError};
use crate::models::{
    Action, CloseResponse, CloseSessionRequest, CloseSessionResponse, Command, CommandResponse,
    CreateSessionRequest, CreateSessionResponse, IsAliveResponse, Observation, ReadFileRequest,
    ReadFileResponse, UploadResponse, WriteFileRequest, WriteFileResponse,
};
use crate::runtime::{LocalRuntime, Runtime};
use axum::Json;
use axum::Router;
use axum::extract::{Multipart, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<LocalRuntime>,
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            runtime: Arc::new(LocalRuntime::new()),
            auth_token,
        }
    }
}

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/is_alive", get(is_alive))
        .route("/create_session", post(create_session))
        .route("/run_in_session", post(run_in_session))
        .route("/close_session", post(close_session))
        .route("/execute", post(execute))
        .route("/read_file", post(read_file))
        .route("/write_file", post(write_file))
        .route("/upload", post(upload))
        .route("/close", post(close))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.auth_token {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"detail": "invalid or missing API key"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

/// Runtime errors leaving a handler become the 511 error transfer.
struct ApiError(RexError);

impl From<RexError> for ApiError {
    fn from(error: RexError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed inside the runtime");
        let transfer = ExceptionTransfer::from(&self.0);
        (
            StatusCode::NETWORK_AUTHENTICATION_REQUIRED,
            Json(ExceptionEnvelope {
                swerexception: transfer,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn is_alive(State(state): State<AppState>) -> ApiResult<Json<IsAliveResponse>> {
    Ok(Json(state.runtime.is_alive(None).await?))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    Ok(Json(state.runtime.create_session(request).await?))
}

async fn run_in_session(
    State(state): State<AppState>,
    Json(action): Json<Action>,
) -> ApiResult<Json<Observation>> {
    Ok(Json(state.runtime.run_in_session(action).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Json(request): Json<CloseSessionRequest>,
) -> ApiResult<Json<CloseSessionResponse>> {
    Ok(Json(state.runtime.close_session(request).await?))
}

async fn execute(
    State(state): State<AppState>,
    Json(command): Json<Command>,
) -> ApiResult<Json<CommandResponse>> {
    Ok(Json(state.runtime.execute(command).await?))
}

async fn read_file(
    State(state): State<AppState>,
    Json(request): Json<ReadFileRequest>,
) -> ApiResult<Json<ReadFileResponse>> {
    Ok(Json(state.runtime.read_file(request).await?))
}

async fn write_file(
    State(state): State<AppState>,
    Json(request): Json<WriteFileRequest>,
) -> ApiResult<Json<WriteFileResponse>> {
    Ok(Json(state.runtime.write_file(request).await?))
}

/// Multipart upload: a `file` part plus `target_path` and `unzip` fields.
/// With `unzip=true` the file is a zip archive extracted into `target_path`;
/// otherwise the bytes land at `target_path` directly.
async fn upload(
    State(_state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut target_path: Option<String> = None;
    let mut unzip = false;
    let mut file_bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RexError::Transport(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("target_path") => {
                target_path = Some(field.text().await.map_err(|e| {
                    RexError::Transport(format!("invalid target_path field: {e}"))
                })?);
            }
            Some("unzip") => {
                unzip = field
                    .text()
                    .await
                    .map_err(|e| RexError::Transport(format!("invalid unzip field: {e}")))?
                    == "true";
            }
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| RexError::Transport(format!("invalid file field: {e}")))?;
                file_bytes = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let target_path = target_path
        .ok_or_else(|| RexError::Transport("missing target_path field".to_string()))?;
    let file_bytes =
        file_bytes.ok_or_else(|| RexError::Transport("missing file field".to_string()))?;

    let target = PathBuf::from(&target_path);
    if unzip {
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(RexError::Io)?;
        tokio::task::spawn_blocking(move || unzip_into(&file_bytes, &target))
            .await
            .map_err(|e| RexError::Io(std::io::Error::other(e)))?
            .map_err(RexError::Io)?;
    } else {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(RexError::Io)?;
            }
        }
        tokio::fs::write(&target, &file_bytes)
            .await
            .map_err(RexError::Io)?;
    }

    Ok(Json(UploadResponse { success: true }))
}

async fn close(State(state): State<AppState>) -> ApiResult<Json<CloseResponse>> {
    Ok(Json(state.runtime.close().await?))
}

fn unzip_into(bytes: &[u8], target: &Path) -> std::io::Result<()> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader).map_err(std::io::Error::other)?;
    archive.extract(target).map_err(std::io::Error::other)
}
