//! Error types for the log and git capabilities.

use thiserror::Error;

/// Errors that can occur when reading from the log, blob or git stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested id is absent from the store.
    #[error("not found: {id}")]
    NotFound { id: String },

    /// Stored data could not be interpreted.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection to the log is gone. Callers may reconnect.
    #[error("log connection closed: {0}")]
    Disconnected(String),

    /// A live tail fell behind and dropped messages.
    #[error("live tail lagged behind by {0} messages")]
    Lagged(u64),
}

impl StoreError {
    /// Shorthand for a [`StoreError::NotFound`].
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the error means the upstream went away rather than
    /// that the request itself was bad.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Lagged(_))
    }
}
