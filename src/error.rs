use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid format error.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Missing or wrong credential.
    #[error("Unauthorized")]
    Unauthorized,

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// PDF processing error.
    #[error("PDF error: {0}")]
    Pdf(String),

    /// XML parsing error.
    #[error("XML parsing error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// Outbound HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A file changed while it was being read.
    #[error("File changed while reading: {0}")]
    FileChanged(String),

    /// External converter failure.
    #[error("Conversion failed: {0}")]
    Conversion(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request error");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        (status, self.to_string()).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
