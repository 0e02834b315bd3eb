use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::core::pipeline::PipelineError;

/// Errors surfaced by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("No segment produced audio")]
    NoAudio,

    #[error("{0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NoAudio => StatusCode::BAD_GATEWAY,
            AppError::Pipeline(err) => match err {
                PipelineError::Segmentation(_) => StatusCode::BAD_REQUEST,
                PipelineError::BackendUnavailable | PipelineError::Closed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                PipelineError::Synthesis(_) | PipelineError::SegmentFailed { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                // Usually the client is gone and nobody reads this status
                PipelineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
                PipelineError::Sink(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::SynthesisError;
    use crate::core::pool::PoolError;
    use crate::core::segmenter::SegmentationError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                AppError::from(PipelineError::Segmentation(SegmentationError::EmptyInput)),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(PipelineError::BackendUnavailable),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::from(PipelineError::SegmentFailed {
                    index: 2,
                    source: PoolError::Synthesis(SynthesisError::Fatal("boom".into())),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                AppError::BadRequest("bad voice".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(PipelineError::Cancelled),
                StatusCode::REQUEST_TIMEOUT,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.status(), status, "{error}");
        }
    }

    #[test]
    fn test_response_carries_status() {
        let response = AppError::from(PipelineError::Closed).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
