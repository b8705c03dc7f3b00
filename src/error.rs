//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`ConversionError`] is the core taxonomy. Every failure inside the task
//!   lifecycle (bad upload, broken conversion, failed verification, storage
//!   trouble, unknown task, timeout) is one of its variants, and each variant
//!   maps to a stable [`ErrorKind`] that is persisted on the task record.
//! - [`AppError`] is what HTTP handlers return. It implements actix-web's
//!   `ResponseError` so a handler can use `?` and still produce a JSON body.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "File not found or conversion not complete",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! Messages stored on task records and sent to clients never contain file
//! paths or decoder internals; those only go to the log.

use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use tracing::error;

/// Machine-readable classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upload is unreadable or not audio
    InvalidInput,
    /// Pipeline produced no output, or output identical to the input
    ConversionFailed,
    /// Output exists but does not have the target shape
    OutputValidationFailed,
    /// Task store could not be read or written
    StorageIo,
    /// Unknown or expired task, or its file is gone
    NotFound,
    /// Conversion exceeded the configured per-task timeout
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ConversionFailed => "conversion_failed",
            ErrorKind::OutputValidationFailed => "output_validation_failed",
            ErrorKind::StorageIo => "storage_io",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the task lifecycle core.
///
/// The `Display` text is client-safe and is what ends up in a task record's
/// `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("Invalid audio file format")]
    InvalidInput,

    #[error("Uploaded file is empty")]
    EmptyUpload,

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Conversion validation failed: {0}")]
    OutputValidationFailed(String),

    #[error("Task storage error: {0}")]
    StorageIo(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Conversion timed out after {0} seconds")]
    Timeout(u64),
}

impl ConversionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConversionError::InvalidInput | ConversionError::EmptyUpload => ErrorKind::InvalidInput,
            ConversionError::ConversionFailed(_) => ErrorKind::ConversionFailed,
            ConversionError::OutputValidationFailed(_) => ErrorKind::OutputValidationFailed,
            ConversionError::StorageIo(_) => ErrorKind::StorageIo,
            ConversionError::NotFound(_) => ErrorKind::NotFound,
            ConversionError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Errors returned by HTTP handlers.
///
/// - **Internal**: Server-side problems (500). The detail is logged, the
///   client only sees a generic message.
/// - **BadRequest**: Client sent invalid data (400)
/// - **NotFound**: Requested task or file doesn't exist (404)
/// - **PayloadTooLarge**: Upload exceeds the configured limit (413)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::Internal(_) => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => actix_web::http::StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => actix_web::http::StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => actix_web::http::StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => {
                error!(detail = %msg, "Internal error while handling request");
                ("internal_error", "An internal error occurred.".to_string())
            }
            AppError::BadRequest(msg) => ("bad_request", msg.clone()),
            AppError::NotFound(msg) => ("not_found", msg.clone()),
            AppError::PayloadTooLarge(msg) => ("payload_too_large", msg.clone()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<ConversionError> for AppError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::NotFound(msg) => AppError::NotFound(msg),
            ConversionError::InvalidInput | ConversionError::EmptyUpload => AppError::BadRequest(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
