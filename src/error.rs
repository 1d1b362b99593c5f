use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("dimension {value} outside [{min}, {max}]")]
    OutOfRangeDimension { value: i64, min: u32, max: u32 },
    #[error("unknown quality tier: {0}")]
    UnknownQualityTier(String),
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("seed must be -1 (random) or non-negative, got {0}")]
    InvalidSeed(i64),
    #[error("generation queue is full")]
    QueueFull,
    #[error("job cancelled before it started")]
    Cancelled,
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("generation exceeded its deadline")]
    GenerationTimeout,
    #[error("model weights are not resident on any tier")]
    PlacementRequired,
    #[error("device memory above ceiling after release: {allocated_bytes} > {ceiling_bytes}")]
    CeilingExceeded {
        allocated_bytes: u64,
        ceiling_bytes: u64,
    },
    #[error(
        "device memory did not return to baseline after reclaim ({allocated_bytes} bytes still allocated)"
    )]
    MemoryWedged { allocated_bytes: u64 },
    #[error("generation worker is unavailable")]
    WorkerUnavailable,
    #[error("image encoding failed: {0}")]
    Encode(String),
}

impl ServiceError {
    /// Faults that require external intervention. The service never retries
    /// these; it reports unhealthy until an operator steps in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServiceError::CeilingExceeded { .. } | ServiceError::MemoryWedged { .. }
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            ServiceError::OutOfRangeDimension { .. }
            | ServiceError::UnknownQualityTier(_)
            | ServiceError::EmptyPrompt
            | ServiceError::InvalidSeed(_)
            | ServiceError::Cancelled => StatusCode::BAD_REQUEST,
            ServiceError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::GenerationTimeout => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::CeilingExceeded { .. }
            | ServiceError::MemoryWedged { .. }
            | ServiceError::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::GenerationFailed(_)
            | ServiceError::PlacementRequired
            | ServiceError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
