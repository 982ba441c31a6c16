//! HTTP front end.
//!
//! Exposes resumable uploads, direct uploads, project creation, and task
//! polling as a JSON/HTTP API. Every mutating call answers as soon as its
//! work is queued; clients poll `GET /api/tasks/{id}` for the outcome.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `OPTIONS` | `{base}` | tus capability discovery |
//! | `POST` | `{base}` | Create an upload session |
//! | `HEAD` | `{base}/{id}` | Current offset of a session |
//! | `PATCH` | `{base}/{id}` | Append a chunk |
//! | `DELETE` | `{base}/{id}` | Terminate a session |
//! | `POST` | `/api/upload` | Direct multipart upload |
//! | `POST` | `/api/projects` | Create a project |
//! | `GET` | `/api/tasks` | List retained tasks |
//! | `GET` | `/api/tasks/{id}` | Poll one task |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! `{base}` is `[uploads].base_path`, `/files` by default.
//!
//! # Identity
//!
//! The caller's already-verified identity arrives in the `x-user-id` header.
//! It is trusted as-is; requests without it get `401`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation", "message": "file type is required" } }
//! ```
//!
//! Error codes: `validation` (400), `transfer` (400), `unauthenticated` (401),
//! `authorization` (403), `not_found` (404), `conflict` (409),
//! `precondition_failed` (412), `too_large` (413), `unsupported_media_type`
//! (415), `repository` (500), `io` (500), `timeout` (500), `internal` (500).

use std::io;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::StreamReader;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use asset_vault_core::metadata::UploadMetadata;
use asset_vault_core::naming::sanitize_folder_path;
use asset_vault_core::task::Task;
use asset_vault_core::VaultError;

use crate::app::Vault;
use crate::config::Config;
use crate::staging::discard_file;
use crate::upload::StagedFile;

pub const TUS_VERSION: &str = "1.0.0";
const TUS_EXTENSIONS: &str = "creation,termination";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";
const USER_HEADER: &str = "x-user-id";
const TASK_ID_HEADER: &str = "x-task-id";
/// Assumed for a `file` part that carries no `Content-Type`.
const DEFAULT_PART_TYPE: &str = "application/octet-stream";

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let vault = Vault::build(config.clone()).await?;
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("asset vault listening on http://{}", config.server.bind);

    axum::serve(listener, router(&vault))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

/// Serve `vault` on an already-bound listener.
pub async fn serve(listener: TcpListener, vault: Vault) -> anyhow::Result<()> {
    axum::serve(listener, router(&vault)).await?;
    Ok(())
}

/// Build the route table.
pub fn router(vault: &Vault) -> Router {
    let base = vault.config.uploads.base_path.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route(&base, post(tus_create).options(tus_options))
        .route(
            &format!("{}/{{id}}", base),
            axum::routing::head(tus_head)
                .patch(tus_patch)
                .delete(tus_terminate)
                .layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/upload",
            post(handle_direct_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/projects", post(handle_create_project))
        .route("/api/tasks", get(handle_list_tasks))
        .route("/api/tasks/{id}", get(handle_get_task))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(vault.clone())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"validation"`, `"conflict"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        let status = match &err {
            VaultError::Validation(_) | VaultError::Transfer(_) => StatusCode::BAD_REQUEST,
            VaultError::Authorization(_) => StatusCode::FORBIDDEN,
            VaultError::NotFound(_) => StatusCode::NOT_FOUND,
            VaultError::OffsetConflict { .. } => StatusCode::CONFLICT,
            VaultError::Repository(_) | VaultError::Io { .. } | VaultError::TimedOut(_) => {
                warn!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.code(), err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "validation", message)
}

fn internal(err: anyhow::Error) -> AppError {
    warn!(error = %err, "internal error");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

/// The caller identity, verified upstream.
fn caller(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::new(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "missing x-user-id header",
            )
        })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<u64, AppError> {
    header_str(headers, name)
        .ok_or_else(|| bad_request(format!("missing {} header", name)))?
        .parse()
        .map_err(|_| bad_request(format!("invalid {} header", name)))
}

// ============ tus protocol ============

/// Add `Tus-Resumable` to every protocol response, error or not.
fn tus_reply(result: Result<Response, AppError>) -> Response {
    let mut response = match result {
        Ok(r) => r,
        Err(e) => e.into_response(),
    };
    response
        .headers_mut()
        .insert("tus-resumable", HeaderValue::from_static(TUS_VERSION));
    response
}

fn check_tus_version(headers: &HeaderMap) -> Result<(), AppError> {
    match header_str(headers, "tus-resumable") {
        Some(TUS_VERSION) => Ok(()),
        other => Err(AppError::new(
            StatusCode::PRECONDITION_FAILED,
            "precondition_failed",
            format!("unsupported Tus-Resumable {:?}; expected {}", other, TUS_VERSION),
        )),
    }
}

async fn tus_options(State(vault): State<Vault>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let h = response.headers_mut();
    h.insert("tus-version", HeaderValue::from_static(TUS_VERSION));
    h.insert("tus-extension", HeaderValue::from_static(TUS_EXTENSIONS));
    h.insert("tus-max-size", HeaderValue::from(vault.uploads.max_size()));
    tus_reply(Ok(response))
}

async fn tus_create(State(vault): State<Vault>, headers: HeaderMap) -> Response {
    tus_reply(create_session(&vault, &headers).await)
}

async fn create_session(vault: &Vault, headers: &HeaderMap) -> Result<Response, AppError> {
    check_tus_version(headers)?;
    let owner = caller(headers)?;
    if headers.contains_key("upload-defer-length") {
        return Err(bad_request("Upload-Defer-Length is not supported"));
    }
    let length = header_u64(headers, "upload-length")?;
    if length > vault.uploads.max_size() {
        return Err(AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too_large",
            format!("upload exceeds Tus-Max-Size of {}", vault.uploads.max_size()),
        ));
    }
    let metadata = header_str(headers, "upload-metadata").unwrap_or_default();

    let session = vault.uploads.create(&owner, length, metadata).await?;
    let location = format!("{}/{}", vault.config.uploads.base_path, session.id);
    let location = HeaderValue::from_str(&location)
        .map_err(|e| internal(anyhow::anyhow!("bad location header: {}", e)))?;

    let mut response = StatusCode::CREATED.into_response();
    response.headers_mut().insert(header::LOCATION, location);
    response
        .headers_mut()
        .insert("upload-offset", HeaderValue::from(0u64));
    Ok(response)
}

async fn tus_head(State(vault): State<Vault>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    let result = async {
        check_tus_version(&headers)?;
        let owner = caller(&headers)?;
        let status = vault.uploads.status(&owner, &id).await?;

        let mut response = StatusCode::OK.into_response();
        let h = response.headers_mut();
        h.insert("upload-offset", HeaderValue::from(status.offset));
        h.insert("upload-length", HeaderValue::from(status.length));
        h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        Ok::<_, AppError>(response)
    }
    .await;
    tus_reply(result)
}

async fn tus_patch(
    State(vault): State<Vault>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    tus_reply(append_chunk(&vault, &id, &headers, body).await)
}

async fn append_chunk(vault: &Vault, id: &str, headers: &HeaderMap, body: Body) -> Result<Response, AppError> {
    check_tus_version(headers)?;
    let owner = caller(headers)?;
    if header_str(headers, header::CONTENT_TYPE.as_str()) != Some(OFFSET_CONTENT_TYPE) {
        return Err(AppError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            format!("Content-Type must be {}", OFFSET_CONTENT_TYPE),
        ));
    }
    let offset = header_u64(headers, "upload-offset")?;

    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(Box::pin(stream));
    let outcome = vault.uploads.append(&owner, id, offset, reader).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    let h = response.headers_mut();
    h.insert("upload-offset", HeaderValue::from(outcome.offset));
    if let Some(task_id) = outcome.task_id {
        if let Ok(v) = HeaderValue::from_str(&task_id) {
            h.insert(TASK_ID_HEADER, v);
        }
    }
    Ok(response)
}

async fn tus_terminate(
    State(vault): State<Vault>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        check_tus_version(&headers)?;
        let owner = caller(&headers)?;
        vault.uploads.terminate(&owner, &id).await?;
        Ok::<_, AppError>(StatusCode::NO_CONTENT.into_response())
    }
    .await;
    tus_reply(result)
}

// ============ POST /api/upload ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedUpload {
    task_id: String,
    message: String,
}

/// Handler for `POST /api/upload`.
///
/// The `file` part is streamed straight into the staging area as it arrives;
/// the other fields may come before or after it.
async fn handle_direct_upload(
    State(vault): State<Vault>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<AcceptedUpload>), AppError> {
    let owner = caller(&headers)?;

    let mut staged: Option<(StagedFile, String, String)> = None;
    let mut project_id: Option<String> = None;
    let mut target_folder: Option<String> = None;

    let outcome: Result<(), AppError> = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
        {
            match field.name().unwrap_or_default() {
                "file" => {
                    if staged.is_some() {
                        return Err(bad_request("only one file part is accepted"));
                    }
                    let filename = field.file_name().unwrap_or_default().to_string();
                    let mime = field.content_type().unwrap_or(DEFAULT_PART_TYPE).to_string();
                    let reader = StreamReader::new(Box::pin(field.map_err(io::Error::other)));
                    let file = vault.uploads.stage_stream(&owner, reader).await?;
                    staged = Some((file, filename, mime));
                }
                "projectId" => {
                    project_id = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?);
                }
                "targetFolderPath" => {
                    target_folder = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?);
                }
                _ => {}
            }
        }
        Ok::<_, AppError>(())
    }
    .await;

    let discard = |staged: &Option<(StagedFile, String, String)>| {
        let path = staged.as_ref().map(|(f, _, _)| f.path.clone());
        async move {
            if let Some(path) = path {
                discard_file(&path).await;
            }
        }
    };

    if let Err(e) = outcome {
        discard(&staged).await;
        return Err(e);
    }
    let project_id = match project_id.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) {
        Some(p) => p,
        None => {
            discard(&staged).await;
            return Err(bad_request("projectId is required"));
        }
    };
    let target_folder = target_folder
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| ".".to_string());
    if let Err(e) = sanitize_folder_path(&target_folder) {
        discard(&staged).await;
        return Err(e.into());
    }
    let Some((file, filename, mime)) = staged else {
        return Err(bad_request("file part is required"));
    };

    let metadata = UploadMetadata {
        project_id,
        target_folder_path: target_folder,
        original_filename: filename,
        mime_type: mime,
    };
    let task_id = vault.uploads.submit_staged(&owner, file, metadata).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedUpload {
            task_id,
            message: "Upload accepted for processing".to_string(),
        }),
    ))
}

// ============ POST /api/projects ============

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectResponse {
    task_id: String,
    project_id: String,
    project_name: String,
    repo_hash: String,
    status: &'static str,
}

async fn handle_create_project(
    State(vault): State<Vault>,
    headers: HeaderMap,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateProjectResponse>), AppError> {
    let owner = caller(&headers)?;
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;

    let ticket = vault.provisioner.create_project(&owner, &req.name).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateProjectResponse {
            task_id: ticket.task_id,
            project_id: ticket.project_id,
            project_name: ticket.project_name,
            repo_hash: ticket.repo_hash,
            status: "queued",
        }),
    ))
}

// ============ GET /api/tasks ============

#[derive(Serialize)]
struct TaskListResponse {
    tasks: Vec<Task>,
}

async fn handle_get_task(
    State(vault): State<Vault>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    match vault.queue.get_task(&id).await.map_err(internal)? {
        Some(task) => Ok(Json(task)),
        None => Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("task not found: {}", id),
        )),
    }
}

async fn handle_list_tasks(State(vault): State<Vault>) -> Result<Json<TaskListResponse>, AppError> {
    let tasks = vault.queue.list_tasks().await.map_err(internal)?;
    Ok(Json(TaskListResponse { tasks }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
