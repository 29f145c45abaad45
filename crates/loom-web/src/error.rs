//! Error types for the web pages.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use loom_store::StoreError;
use loom_view::{ErrorKind, ViewError};
use thiserror::Error;
use tracing::{error, warn};

use crate::html::{error_section, layout};

/// Errors that fail a whole page.
#[derive(Debug, Error)]
pub enum WebError {
    /// A read model failed.
    #[error(transparent)]
    View(#[from] ViewError),

    /// The store failed outside any read model.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The request itself is unusable.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl WebError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::View(e) => match e.kind {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Disconnected => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Malformed => StatusCode::INTERNAL_SERVER_ERROR,
            },
            WebError::Store(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            WebError::Store(e) if e.is_disconnect() => StatusCode::SERVICE_UNAVAILABLE,
            WebError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WebError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = %status, error = %self, "web: request failed");
        } else {
            warn!(status = %status, error = %self, "web: request rejected");
        }
        let title = status.canonical_reason().unwrap_or("Error");
        let body = layout("en", title, &error_section(&self.to_string()));
        (status, Html(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            WebError::from(ViewError::not_found("%x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WebError::from(ViewError::validation("empty")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebError::from(ViewError::disconnected("gone")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WebError::from(StoreError::Lagged(3)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WebError::from(StoreError::not_found("&blob")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WebError::from(StoreError::Malformed("bad".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
