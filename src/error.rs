use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::error;
use serde::{Deserialize, Serialize};

use crate::db::StoreError;

/// Every way a poll action can be refused or fail.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InvalidReference(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PollResult<T> = Result<T, PollError>;

impl PollError {
    /// Name sent as `type` in socket exceptions and `error` in HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Unauthenticated(_) => "Unauthenticated",
            PollError::Forbidden(_) => "Forbidden",
            PollError::InvalidState(_) => "InvalidState",
            PollError::NotFound(_) => "NotFound",
            PollError::BadRequest(_) => "BadRequest",
            PollError::InvalidReference(_) => "InvalidReference",
            PollError::StorageUnavailable(_) => "StorageUnavailable",
            PollError::Internal(_) => "Internal",
        }
    }

    /// Message safe to hand back to a client. Server-side details stay in the log.
    pub fn client_message(&self) -> String {
        match self {
            PollError::StorageUnavailable(_) | PollError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for PollError {
    fn from(err: StoreError) -> Self {
        PollError::StorageUnavailable(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for PollError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        PollError::Unauthenticated(format!("Invalid token: {}", err))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let status = match &self {
            PollError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            PollError::Forbidden(_) => StatusCode::FORBIDDEN,
            PollError::NotFound(_) => StatusCode::NOT_FOUND,
            PollError::InvalidState(_) => StatusCode::CONFLICT,
            PollError::BadRequest(_) | PollError::InvalidReference(_) => StatusCode::BAD_REQUEST,
            PollError::StorageUnavailable(msg) => {
                error!("Storage failure while serving request: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PollError::Internal(msg) => {
                error!("Internal failure while serving request: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.client_message(),
        };

        (status, Json(body)).into_response()
    }
}
