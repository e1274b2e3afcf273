//! Unified error handling for the server.
//!
//! Every failure is rendered as a JSON body carrying an `errorType`
//! discriminator. Version conflicts also carry the server's copy of the record
//! so the client can run its conflict handler.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ferry_engine::{RemoteError, RemoteRecord};
use serde::{Deserialize, Serialize};

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The version-conditioned mutation rule refused the write.
    #[error(transparent)]
    Mutation(#[from] RemoteError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Discriminator sent in every error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    ConflictUnhandled,
    ConditionalCheck,
    Unauthorized,
    BadRequest,
    Unavailable,
    Internal,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_type: ErrorType,
    pub message: String,
    /// Server copy of the record, present on version conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<RemoteRecord>,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Mutation(RemoteError::ConflictUnhandled(_)) => StatusCode::CONFLICT,
            AppError::Mutation(RemoteError::ConditionalCheckFailed(_)) => {
                StatusCode::PRECONDITION_FAILED
            }
            AppError::Mutation(RemoteError::Unauthorized(_)) | AppError::Unauthorized(_) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Mutation(RemoteError::Network { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Mutation(RemoteError::Rejected(_)) | AppError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            AppError::Database(_) | AppError::Internal(_) => ErrorType::Internal,
            AppError::Mutation(RemoteError::ConflictUnhandled(_)) => ErrorType::ConflictUnhandled,
            AppError::Mutation(RemoteError::ConditionalCheckFailed(_)) => {
                ErrorType::ConditionalCheck
            }
            AppError::Mutation(RemoteError::Unauthorized(_)) | AppError::Unauthorized(_) => {
                ErrorType::Unauthorized
            }
            AppError::Mutation(RemoteError::Network { .. }) => ErrorType::Unavailable,
            AppError::Mutation(RemoteError::Rejected(_)) | AppError::BadRequest(_) => {
                ErrorType::BadRequest
            }
        }
    }

    fn body(&self) -> ErrorResponse {
        let (message, record) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("Internal server error".to_string(), None)
            }
            AppError::Mutation(RemoteError::ConflictUnhandled(server)) => {
                (self.to_string(), Some(server.as_ref().clone()))
            }
            AppError::Mutation(e) => {
                tracing::debug!("Mutation refused: {}", e);
                (e.to_string(), None)
            }
            AppError::BadRequest(msg) | AppError::Unauthorized(msg) => (msg.clone(), None),
        };

        ErrorResponse {
            error_type: self.error_type(),
            message,
            record,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
