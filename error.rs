use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::store::StoreError;

/// Error categories visible to clients.
///
/// Every failure that crosses the dispatch pipeline is reduced to one of
/// these codes before it is serialized into an Error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Unauthorized,
    Conflict,
    InvalidRequest,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Custom error types for Strongbox operations
#[derive(Debug, Error)]
pub enum StrongboxError {
    /// Entity missing, purged or soft-deleted
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing role, missing file access, or a broken key chain
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Absent, invalid or expired session, or a bad credential payload
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Version mismatch or duplicate name
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad arguments or wrong file type
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's lifetime ended before the operation completed
    #[error("Cancelled")]
    Cancelled,

    /// Unexpected fault, never shown verbatim to clients
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrongboxError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to a remote peer.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from a peer.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::Forbidden => Self::Forbidden(message),
            ErrorKind::Unauthorized => Self::Unauthorized(message),
            ErrorKind::Conflict => Self::Conflict(message),
            ErrorKind::InvalidRequest => Self::InvalidRequest(message),
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Internal => Self::Internal(message),
        }
    }
}

impl From<StoreError> for StrongboxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } | StoreError::Gone { .. } => Self::NotFound(err.to_string()),
            StoreError::Conflict { .. } => Self::Conflict(err.to_string()),
            StoreError::Cancelled => Self::Cancelled,
            StoreError::Engine(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StrongboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("malformed payload: {}", err))
    }
}

impl From<std::io::Error> for StrongboxError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type Result<T, E = StrongboxError> = std::result::Result<T, E>;
