//! Error types for the quay server.
//!
//! Two tiers: [`ServerError`] covers process-level failures (bind, watcher,
//! configuration), while [`HttpError`] is the request-scoped taxonomy that
//! maps onto HTTP status codes. Boundary components (router, resolver, proxy,
//! SSR) convert their internal failures into `HttpError` so that every
//! request produces exactly one response and nothing escapes to the
//! connection task.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use std::path::PathBuf;
use thiserror::Error;

/// Process-level server error.
///
/// Returned by construction, bind and lifecycle entry points. Automatically
/// converts from domain errors via `From` implementations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid server or mount configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mount root or index file doesn't exist
    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// Failed to bind the listener
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we attempted to bind
        addr: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// I/O errors from file system operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File watching errors
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid proxy rule (bad target URL or rewrite pattern)
    #[error("Invalid proxy rule: {0}")]
    ProxyRule(String),

    /// Generic errors with custom messages
    #[error("{0}")]
    Custom(String),
}

/// Request-scoped error taxonomy.
///
/// Every variant carries enough context for a useful response body; the
/// status mapping is fixed and tested.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Malformed request body (bad JSON, undecodable form) -> 400
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Path escape, NUL byte, boundary violation -> 403
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No file, no route, no SSR fallback -> 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// API router configured, no match, mutating verb -> 405
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Request body exceeded the configured limit -> 413
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge {
        /// Configured body size limit
        limit: usize,
    },

    /// Rate limit middleware rejected the request -> 429
    #[error("Too many requests")]
    RateLimited,

    /// Proxy connect/stream failure before response headers -> 502
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// SSR or transform callback failed -> 500
    #[error("Render failure: {0}")]
    RenderFailure(String),

    /// Anything else that reached the dispatcher -> 500
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HttpError {
    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Forbidden(_) => StatusCode::FORBIDDEN,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            HttpError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            HttpError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            HttpError::RenderFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable label used in JSON error bodies.
    fn label(&self) -> &'static str {
        match self {
            HttpError::BadRequest(_) => "Bad Request",
            HttpError::Forbidden(_) => "Forbidden",
            HttpError::NotFound(_) => "Not Found",
            HttpError::MethodNotAllowed(_) => "Method Not Allowed",
            HttpError::PayloadTooLarge { .. } => "Payload Too Large",
            HttpError::RateLimited => "Too Many Requests",
            HttpError::UpstreamUnavailable(_) => "Bad Gateway",
            HttpError::RenderFailure(_) => "Render Failure",
            HttpError::Internal(_) => "Internal Server Error",
        }
    }

    /// Convert into a JSON error response.
    pub fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.label(),
            "message": self.to_string(),
        });

        Response::builder()
            .status(self.status())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| {
                // Response::builder only fails on invalid parts, which are
                // all constants here.
                Response::new(Body::empty())
            })
    }
}

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => HttpError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => HttpError::Forbidden(err.to_string()),
            _ => HttpError::Internal(err.to_string()),
        }
    }
}

/// Result type alias using `ServerError` as the default error type.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Extension trait for adding context to `Result` types.
pub trait ResultExt<T> {
    /// Replace a not-found I/O error with a path-aware error.
    fn with_path(self, path: impl AsRef<std::path::Path>) -> Result<T>;

    /// Prefix the error with a context message.
    fn context(self, msg: impl std::fmt::Display) -> Result<T>;
}

impl<T, E: Into<ServerError>> ResultExt<T> for std::result::Result<T, E> {
    fn with_path(self, path: impl AsRef<std::path::Path>) -> Result<T> {
        self.map_err(|e| {
            let err: ServerError = e.into();
            match err {
                ServerError::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                    ServerError::PathNotFound(path.as_ref().to_path_buf())
                }
                other => other,
            }
        })
    }

    fn context(self, msg: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| {
            let err: ServerError = e.into();
            ServerError::Custom(format!("{}: {}", msg, err))
        })
    }
}
