//! Coordinator error taxonomy
//!
//! Every manager operation returns [`CoordinatorError`]; callers map it to a
//! status code with [`CoordinatorError::status_code`].

use kudu_client::ClientError;
use std::io;
use thiserror::Error;

use crate::lock::LockError;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A named lock could not be acquired within its timeout
    #[error("operation '{operation}' is already in progress")]
    Busy { operation: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    /// Storage cannot be accessed right now (access denied, read-only)
    #[error("{0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn busy(operation: impl Into<String>) -> Self {
        Self::Busy {
            operation: operation.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Busy { .. } | Self::Conflict(_) => 409,
            Self::Validation(_) => 400,
            Self::JobNotFound(_) => 404,
            Self::Unavailable(_) => 503,
            Self::Io(_) | Self::Serialization(_) | Self::Client(_) | Self::Internal(_) => 500,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

impl From<io::Error> for CoordinatorError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::Unavailable(format!("storage is not accessible: {}", e))
            }
            _ => Self::Io(e),
        }
    }
}

impl From<LockError> for CoordinatorError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Io(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for CoordinatorError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(e) => e.into(),
            other => Self::Validation(format!("invalid zip archive: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(CoordinatorError::busy("deploy").status_code(), 409);
        assert_eq!(CoordinatorError::Conflict("dup".into()).status_code(), 409);
        assert_eq!(CoordinatorError::Validation("bad".into()).status_code(), 400);
        assert_eq!(CoordinatorError::JobNotFound("x".into()).status_code(), 404);
        assert_eq!(CoordinatorError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_io_classification() {
        let denied: CoordinatorError =
            io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(denied, CoordinatorError::Unavailable(_)));
        assert_eq!(denied.status_code(), 503);

        let missing: CoordinatorError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(missing, CoordinatorError::Io(_)));
        assert_eq!(missing.status_code(), 500);
    }
}
