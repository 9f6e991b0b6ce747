//! Error types for heartsync-bf
//!
//! [`Error`] is the service's internal error. [`ApiError`] is what HTTP
//! handlers return: it logs the detail and answers with a fixed, generic
//! body so nothing internal reaches the browser.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::warn;

use crate::session::SessionId;

/// Main error type for heartsync-bf
#[derive(Error, Debug)]
pub enum Error {
    /// Operation referenced a session that is not (or no longer) registered
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// No songs configured; sessions cannot start
    #[error("Song catalog is empty")]
    EmptyCatalog,

    /// Song directory could not be read
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Song features could not be computed
    #[error("Feature extraction error: {0}")]
    Features(String),

    /// `step` called before `reset`
    #[error("Episode not started: call reset first")]
    EpisodeNotStarted,

    /// `step` called on a terminated or truncated episode
    #[error("Episode already finished")]
    EpisodeFinished,

    /// The other end of a session channel is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Checkpoint artifact could not be saved or loaded
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Image or frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// heartsync-common error
    #[error("Common error: {0}")]
    Common(#[from] heartsync_common::Error),
}

/// Convenience Result type using heartsync-bf Error
pub type Result<T> = std::result::Result<T, Error>;

/// Body of every failed HTTP response
pub const GENERIC_FAILURE_BODY: &str = "Something went wrong.";

/// API error type
///
/// Every variant maps to `400 Bad Request` with [`GENERIC_FAILURE_BODY`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request (missing or non-numeric parameter, bad JSON)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Failure inside the service
    #[error(transparent)]
    Service(#[from] Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self, "Request failed");
        (StatusCode::BAD_REQUEST, GENERIC_FAILURE_BODY).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;
