//! Error types for the Ferry engine.
//!
//! Every error that crosses a component boundary is one of these variants.
//! Transport-specific failures arrive as [`RemoteError`] and are translated
//! here before they reach the lifecycle stream.

use crate::remote::RemoteError;
use crate::{ModelName, RecordId, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Taxonomy errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("conflict on {model} {record_id}: {message}")]
    Conflict {
        model: ModelName,
        record_id: RecordId,
        message: String,
    },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    // Validation errors
    #[error("model not found: {0}")]
    ModelNotFound(ModelName),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(RecordId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

/// Coarse classification of an [`Error`], matching the engine's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    Network,
    Conflict,
    Rejected,
    Configuration,
    Cancelled,
    Validation,
}

impl Error {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage(_) | Error::InvalidSnapshot(_) | Error::SchemaVersionMismatch { .. } => {
                ErrorKind::Storage
            }
            Error::Network(_) => ErrorKind::Network,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Rejected(_) => ErrorKind::Rejected,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::ModelNotFound(_)
            | Error::RecordNotFound(_)
            | Error::RecordAlreadyExists(_)
            | Error::InvalidPayload(_)
            | Error::MissingRequiredField(_)
            | Error::TypeMismatch { .. } => ErrorKind::Validation,
        }
    }

    /// Returns true if the failed operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network)
    }

    /// Returns true if this error must stop the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Configuration)
    }

    /// Storage failures are built from whatever the backing store reports.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network {
                message,
                retryable: true,
            } => Error::Network(message),
            RemoteError::Network {
                message,
                retryable: false,
            } => Error::Rejected(message),
            RemoteError::ConflictUnhandled(remote) => Error::Conflict {
                model: remote.record.model.clone(),
                record_id: remote.record.id.clone(),
                message: format!("server holds version {}", remote.version),
            },
            RemoteError::ConditionalCheckFailed(message) => {
                Error::Rejected(format!("conditional check failed: {message}"))
            }
            RemoteError::Rejected(message) => Error::Rejected(message),
            RemoteError::Unauthorized(message) => {
                Error::Rejected(format!("unauthorized: {message}"))
            }
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
