use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

pub mod command;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod ladder;
pub mod progress;
pub mod state;
pub mod supervisor;
pub mod transcoder;
pub mod workspace;

pub use config::{EncodeSettings, PipelineConfig};
pub use error::PipelineError;
pub use ffmpeg::Ffmpeg;
pub use state::VideoServerState;
pub use transcoder::{SubmittedJob, Transcoder};

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: String,
    pub source_height: u32,
    pub renditions: Vec<u32>,
    pub encode_seconds: f64,
}

impl From<SubmittedJob> for UploadResponse {
    fn from(job: SubmittedJob) -> Self {
        Self {
            job_id: job.job_id,
            source_height: job.source_height,
            renditions: job.renditions,
            encode_seconds: job.report.wall_clock.as_secs_f64(),
        }
    }
}

pub fn create_router(state: VideoServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route(
            "/api/video/upload",
            post(upload_handler).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/video/streaming/{job_id}/{file_name}",
            get(streaming_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upload_handler(
    State(state): State<VideoServerState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            continue;
        };

        let job = state
            .transcoder
            .submit(&file_name, field)
            .await
            .map_err(|e| (e.status_code(), e.to_string()))?;

        return Ok(Json(job.into()));
    }

    tracing::warn!("Upload request carried no file field");
    Err((StatusCode::BAD_REQUEST, "no file field in upload".to_string()))
}

async fn streaming_handler(
    State(state): State<VideoServerState>,
    Path((job_id, file_name)): Path<(String, String)>,
) -> Result<Response, PipelineError> {
    let path = state
        .transcoder
        .workspaces()
        .resolve_artifact(&job_id, &file_name)
        .await?;

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        tracing::warn!("Artifact vanished before open: {}: {e}", path.display());
        PipelineError::NotFound
    })?;
    let length = file.metadata().await.map(|m| m.len()).ok();

    let mut response = (
        [(header::CONTENT_TYPE, content_type(&file_name))],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();
    if let Some(length) = length {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from(length));
    }

    Ok(response)
}

fn content_type(file_name: &str) -> &'static str {
    if file_name.ends_with(".m3u8") {
        "application/x-mpegURL"
    } else if file_name.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub encoder: String,
    pub active_jobs: usize,
}

async fn info_handler(State(state): State<VideoServerState>) -> Json<ServerInfo> {
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        encoder: state.transcoder.ffmpeg().version().to_string(),
        active_jobs: state.transcoder.active_jobs(),
    })
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
    }))
}
