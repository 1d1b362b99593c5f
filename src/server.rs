use std::io::Cursor;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use base64::{Engine, prelude::BASE64_STANDARD};
use image::RgbImage;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::{
    config::AppConfig,
    error::ServiceError,
    health::ServiceStatus,
    queue::JobQueue,
    request::{self, RawGenerationRequest},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub queue: Arc<JobQueue>,
    pub status: Arc<ServiceStatus>,
}

#[derive(Serialize)]
struct GenerateResponse {
    success: bool,
    /// Base64-encoded PNG.
    image: String,
    /// The concrete seed used, echoed back so callers can reproduce the
    /// image even when they asked for a random one.
    seed: u64,
    prompt: String,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    model: String,
    device_allocated_bytes: u64,
    device_reserved_bytes: u64,
    queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<String>,
}

#[derive(Serialize)]
struct ClearMemoryResponse {
    ok: bool,
    device_allocated_bytes_after: u64,
}

pub fn build_router(
    config: Arc<AppConfig>,
    queue: Arc<JobQueue>,
    status: Arc<ServiceStatus>,
) -> Router {
    let state = AppState {
        config,
        queue,
        status,
    };

    Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health))
        .route("/clear_memory", post(clear_memory))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Synchronous from the caller's perspective; internally the job is queued
/// behind the single accelerator worker.
async fn generate(
    State(state): State<AppState>,
    Json(raw): Json<RawGenerationRequest>,
) -> Result<Json<GenerateResponse>, ServiceError> {
    let request = request::validate(raw)?;
    let seed = request.seed;
    let prompt = request.prompt.clone();

    let ticket = state.queue.submit(request)?;
    let image = ticket.wait().await?;

    Ok(Json(GenerateResponse {
        success: true,
        image: encode_png_base64(&image)?,
        seed,
        prompt,
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.status.probe();
    Json(HealthResponse {
        ok: report.ok,
        model: state.config.model_id.clone(),
        device_allocated_bytes: report.device_allocated_bytes,
        device_reserved_bytes: report.device_reserved_bytes,
        queue_depth: report.queue_depth,
        fault: report.fault,
    })
}

/// Operator/administrative path for recovering a wedged device.
async fn clear_memory(
    State(state): State<AppState>,
) -> Result<Json<ClearMemoryResponse>, ServiceError> {
    let snapshot = state.queue.reclaim().await?;
    Ok(Json(ClearMemoryResponse {
        ok: true,
        device_allocated_bytes_after: snapshot.device_allocated_bytes,
    }))
}

fn encode_png_base64(image: &RgbImage) -> Result<String, ServiceError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| ServiceError::Encode(e.to_string()))?;
    Ok(BASE64_STANDARD.encode(&bytes))
}
