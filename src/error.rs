use crate::storage::StorageError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error (fatal at startup).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required server setting is missing; surfaced per request.
    #[error("Server misconfigured: {0}")]
    Misconfigured(String),

    /// Missing or wrong shared secret.
    #[error("{0}")]
    Unauthorized(String),

    /// Malformed or incomplete request.
    #[error("{0}")]
    BadRequest(String),

    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No `metadata.db` at the requested library path.
    #[error("{}", library_not_found_message(.path, .suggestions))]
    LibraryNotFound {
        /// Normalized library path that was checked.
        path: String,
        /// Sibling folders that do contain a `metadata.db`.
        suggestions: Vec<String>,
    },

    /// Downloaded content failed a plausibility check.
    #[error("{0}")]
    Validation(String),

    /// Remote store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// SQLite error from the synced catalog.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Image processing error.
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn library_not_found_message(path: &str, suggestions: &[String]) -> String {
    let mut msg = format!("metadata.db not found at '{}'", path);
    if suggestions.is_empty() {
        msg.push_str("\n\nMake sure the path points to your Calibre Library folder.");
    } else {
        msg.push_str(&format!(
            "\n\nFound Calibre libraries at: {}",
            suggestions.join(", ")
        ));
    }
    msg
}

/// JSON failure body returned by every API route.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code for errors the client reacts to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    /// Set when the client should prompt for the app password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,
    /// Set when the server itself is not configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub misconfigured: Option<bool>,
}

impl AppError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Misconfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_)
            | AppError::LibraryNotFound { .. }
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                StorageError::NotAFile(_) | StorageError::NotAFolder(_) => StatusCode::BAD_REQUEST,
                StorageError::Auth(_) => StatusCode::UNAUTHORIZED,
                StorageError::Security(_) => StatusCode::FORBIDDEN,
                StorageError::Transport(_) => StatusCode::BAD_GATEWAY,
                StorageError::Io(_) | StorageError::Backend(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            success: false,
            error: self.to_string(),
            error_code: None,
            auth_required: None,
            misconfigured: None,
        };

        match self {
            AppError::Config(_) | AppError::Misconfigured(_) => body.misconfigured = Some(true),
            AppError::Unauthorized(_) => body.auth_required = Some(true),
            AppError::Storage(StorageError::Auth(_)) => {
                body.error_code = Some("DROPBOX_AUTH_FAILED")
            }
            AppError::Storage(StorageError::Security(_)) => {
                body.error_code = Some("PATH_TRAVERSAL")
            }
            _ => {}
        }

        body
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request error");
        } else {
            tracing::warn!(error = %self, status = %status, "Request rejected");
        }

        (status, Json(self.body())).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
