//! REST API routes

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::config;
use crate::download::{Download, DownloadRequest, RegistryError, MAX_CHUNKS};
use crate::util;
use crate::AppState;

/// Create API routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Downloads
        .route("/downloads", get(list_downloads))
        .route("/downloads", post(add_download))
        .route("/downloads/{id}", get(get_download))
        .route("/downloads/{id}", delete(remove_download))
        .route("/downloads/{id}/pause", post(pause_download))
        .route("/downloads/{id}/resume", post(resume_download))
        .route("/downloads/{id}/file", get(fetch_file))
        // Settings
        .route("/settings", get(get_settings))
        .route("/settings", put(update_settings))
}

// ============ Download Endpoints ============

/// List all downloads
async fn list_downloads(State(state): State<Arc<AppState>>) -> Json<Vec<Download>> {
    Json(state.manager.list())
}

/// Request to add a new download
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDownloadRequest {
    pub url: String,
    pub filename: Option<String>,
    pub chunks: Option<usize>,
    pub connect_timeout: Option<String>,
    pub read_timeout: Option<String>,
}

/// Add a new download
async fn add_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddDownloadRequest>,
) -> Result<Json<Download>, AppError> {
    let defaults = state.settings.read().downloads.clone();

    let connect_timeout = match req.connect_timeout.as_deref() {
        Some(raw) => util::parse_duration(raw)
            .map_err(|e| AppError::BadRequest(format!("connectTimeout: {e}")))?,
        None => defaults.parsed_connect_timeout(),
    };
    let read_timeout = match req.read_timeout.as_deref() {
        Some(raw) => util::parse_duration(raw)
            .map_err(|e| AppError::BadRequest(format!("readTimeout: {e}")))?,
        None => defaults.parsed_read_timeout(),
    };

    let download = state.manager.add(DownloadRequest {
        url: req.url,
        filename: req.filename,
        chunks: req.chunks.unwrap_or(defaults.default_chunks),
        connect_timeout,
        read_timeout,
    })?;

    Ok(Json(download))
}

/// Get one download snapshot
async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Download>, AppError> {
    Ok(Json(state.manager.get(&id)?))
}

/// Pause an active download
async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.manager.pause(&id)?;
    Ok(StatusCode::OK)
}

/// Resume a paused download
async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.manager.resume(&id)?;
    Ok(StatusCode::OK)
}

/// Remove a download; a completed artifact stays on disk
async fn remove_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream the completed artifact
async fn fetch_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (filename, file) = state.manager.open_completed(&id).await?;

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

// ============ Settings Endpoints ============

/// Settings response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsResponse {
    pub default_chunks: usize,
    pub connect_timeout: String,
    pub read_timeout: String,
    pub download_directory: String,
}

impl SettingsResponse {
    fn from_settings(settings: &config::Settings) -> Self {
        Self {
            default_chunks: settings.downloads.default_chunks,
            connect_timeout: settings.downloads.connect_timeout.clone(),
            read_timeout: settings.downloads.read_timeout.clone(),
            download_directory: settings.downloads.directory.display().to_string(),
        }
    }
}

/// Get current settings
async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsResponse> {
    let settings = state.settings.read();
    Json(SettingsResponse::from_settings(&settings))
}

/// Update settings request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub default_chunks: Option<usize>,
    pub connect_timeout: Option<String>,
    pub read_timeout: Option<String>,
}

/// Update settings
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<SettingsResponse>, AppError> {
    let mut settings = state.settings.write();

    if let Some(chunks) = req.default_chunks {
        if chunks < 1 || chunks > MAX_CHUNKS {
            return Err(AppError::BadRequest(format!(
                "defaultChunks must be between 1 and {MAX_CHUNKS}"
            )));
        }
        settings.downloads.default_chunks = chunks;
    }
    if let Some(raw) = req.connect_timeout {
        util::parse_duration(&raw)
            .map_err(|e| AppError::BadRequest(format!("connectTimeout: {e}")))?;
        settings.downloads.connect_timeout = raw;
    }
    if let Some(raw) = req.read_timeout {
        util::parse_duration(&raw)
            .map_err(|e| AppError::BadRequest(format!("readTimeout: {e}")))?;
        settings.downloads.read_timeout = raw;
    }

    config::save(&settings)?;

    Ok(Json(SettingsResponse::from_settings(&settings)))
}

// ============ Error Handling ============

/// Application error type
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => AppError::NotFound("download not found".into()),
            RegistryError::InvalidRequest(msg) => AppError::BadRequest(msg),
            RegistryError::InvalidState(msg) => AppError::Conflict(msg),
            RegistryError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                AppError::NotFound("downloaded file not found".into())
            }
            RegistryError::Io(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
