//! Error handling for REST API
//!
//! Provides the `AppError` type used across all REST endpoints and the
//! conversions from each domain error.

use axum::{http::StatusCode, response::IntoResponse, Json};

use crate::delivery::FetchError;
use crate::manifest::ManifestError;
use crate::selfheal::SelfHealError;
use crate::session::SessionError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => {
                // Log full details server-side, return generic message to client
                tracing::error!(details = %msg, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred".to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ManifestError> for AppError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Unavailable { .. } => AppError::Unavailable(err.to_string()),
            ManifestError::Load { .. } => AppError::Internal(err.to_string()),
        }
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::ChunkUnavailable(_) => {
                tracing::warn!(error = %err, "chunk delivery exhausted");
                AppError::BadGateway(err.to_string())
            }
            FetchError::InvalidRange(_) => AppError::BadRequest(err.to_string()),
            FetchError::UnknownChunk(_) => AppError::NotFound(err.to_string()),
        }
    }
}

impl From<SelfHealError> for AppError {
    fn from(err: SelfHealError) -> Self {
        match err {
            SelfHealError::InvalidRepairInput(_) => AppError::BadRequest(err.to_string()),
            SelfHealError::ReportNotFound(_) => AppError::NotFound(err.to_string()),
            SelfHealError::Task(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound(err.to_string()),
            SessionError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status = |e: AppError| e.into_response().status();
        assert_eq!(
            status(ManifestError::Unavailable { slug: "s".into(), version: "1".into() }.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(FetchError::ChunkUnavailable("x".into()).into()), StatusCode::BAD_GATEWAY);
        assert_eq!(status(FetchError::InvalidRange("x".into()).into()), StatusCode::BAD_REQUEST);
        assert_eq!(status(FetchError::UnknownChunk("x".into()).into()), StatusCode::NOT_FOUND);
        assert_eq!(
            status(SelfHealError::InvalidRepairInput("x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SessionError::NotFound(uuid::Uuid::nil()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(AppError::Internal("secret".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
