//! Structured errors for the read models.

use std::fmt;

use loom_store::StoreError;
use thiserror::Error;

/// Broad class of a [`ViewError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Requested id is absent from the log or a repository.
    NotFound,
    /// Stored data, a catalog or diff input could not be parsed.
    Malformed,
    /// The log connection is gone; retrying after a reconnect may succeed.
    Disconnected,
    /// The request was rejected before any work started.
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Validation => "invalid request",
        };
        f.write_str(s)
    }
}

/// An aggregation failure.
///
/// Cloneable so that one failed computation can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ViewError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ViewError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// True when the caller should reconnect rather than give up.
    pub fn is_disconnect(&self) -> bool {
        self.kind == ErrorKind::Disconnected
    }
}

impl From<StoreError> for ViewError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Malformed(_) | StoreError::Json(_) => ErrorKind::Malformed,
            StoreError::Disconnected(_) | StoreError::Lagged(_) => ErrorKind::Disconnected,
            StoreError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            StoreError::Io(_) => ErrorKind::Disconnected,
        };
        Self::new(kind, e.to_string())
    }
}
