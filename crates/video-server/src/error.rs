use std::{io, time::Duration};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::progress::ProgressSample;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("workspace error: {0}")]
    Workspace(#[source] io::Error),
    #[error("upload interrupted: {0}")]
    Upload(#[source] io::Error),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("encoder failed (exit code {}): {stderr_tail}", exit_code.unwrap_or(-1))]
    Encode {
        exit_code: Option<i32>,
        stderr_tail: String,
        last_progress: Option<ProgressSample>,
    },
    #[error("encoder timed out after {}s and was killed", after.as_secs())]
    Timeout {
        after: Duration,
        last_progress: Option<ProgressSample>,
    },
    #[error("encode cancelled")]
    Cancelled { last_progress: Option<ProgressSample> },
    #[error("not found")]
    NotFound,
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Workspace(_) | PipelineError::Encode { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PipelineError::Upload(_) => StatusCode::BAD_REQUEST,
            PipelineError::Probe(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Progress observed before the encode stopped, if it got that far.
    pub fn last_progress(&self) -> Option<&ProgressSample> {
        match self {
            PipelineError::Encode { last_progress, .. }
            | PipelineError::Timeout { last_progress, .. }
            | PipelineError::Cancelled { last_progress } => last_progress.as_ref(),
            _ => None,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            // Lookup misses never say why.
            PipelineError::NotFound => "not found".to_string(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_has_no_detail() {
        assert_eq!(PipelineError::NotFound.to_string(), "not found");
        assert_eq!(PipelineError::NotFound.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_encode_error_keeps_partial_progress() {
        let err = PipelineError::Encode {
            exit_code: Some(1),
            stderr_tail: "boom".to_string(),
            last_progress: Some(ProgressSample::new(
                Duration::from_secs(1),
                Duration::from_secs(4),
            )),
        };
        assert_eq!(err.last_progress().map(|p| p.percent), Some(25));
        assert_eq!(err.to_string(), "encoder failed (exit code 1): boom");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PipelineError::Probe("bad".to_string()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            PipelineError::Timeout {
                after: Duration::from_secs(5),
                last_progress: None
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
