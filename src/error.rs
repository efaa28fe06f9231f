use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure modes of the daily-menu operations.
#[derive(Error, Debug)]
pub enum VoteError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// An optimistic write lost against a concurrent writer. Safe to retry.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl VoteError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        VoteError::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        VoteError::Validation(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, VoteError::Conflict(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VoteError::NotFound(_) => StatusCode::NOT_FOUND,
            VoteError::Validation(_) => StatusCode::BAD_REQUEST,
            VoteError::Conflict(_) => StatusCode::CONFLICT,
            VoteError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for VoteError {
    fn from(e: sqlx::Error) -> Self {
        VoteError::Internal(e.into())
    }
}

impl IntoResponse for VoteError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            VoteError::Internal(e) => {
                tracing::error!("request failed: {e:#}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
