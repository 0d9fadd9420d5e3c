//! Gateway error types.
//!
//! Every variant maps to one of the error classes the API exposes:
//! client-input problems (4xx, never retried), transient infrastructure
//! failures (5xx), data-integrity rejections, and not-found.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(GatewayError::LinkExpired)`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// JSON envelope used by every API response, success or failure.
///
/// Mirrors the original gateway wire format: `{code, message, data}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// HTTP-like status code echoed in the body.
    pub code: u16,
    /// Human-readable message; empty on success.
    pub message: String,
    /// Payload, `null` on failure.
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Successful envelope wrapping `data`.
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: String::new(),
            data: Some(data),
        }
    }
}

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A request parameter is malformed or inconsistent.
    #[error("{message}")]
    InvalidParam { message: String },

    /// The signed link's issue date is older than its expire window.
    #[error("the link has expired")]
    LinkExpired,

    /// The request signature does not match the computed one.
    #[error("signature verification failed")]
    SignatureMismatch,

    /// Uploaded or merged bytes do not hash to the declared value.
    #[error("content hash mismatch: computed {computed}, declared {declared}")]
    HashMismatch { computed: String, declared: String },

    /// Stored chunk count does not match the declared total.
    #[error("chunk count mismatch: {stored} stored, {declared} declared")]
    ChunkCountMismatch { stored: i64, declared: i64 },

    /// The uid (or the peer holding it) cannot be found.
    #[error("{message}")]
    NotFound { message: String },

    /// The per-chunk registration lock is held by a concurrent request.
    #[error("resource busy, concurrent request in flight")]
    LockBusy,

    /// A collaborator (store, cache, peer) is unreachable.
    #[error("{message}")]
    Unavailable { message: String },

    /// Catch-all for unexpected internal errors.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidParam { .. }
            | GatewayError::LinkExpired
            | GatewayError::HashMismatch { .. }
            | GatewayError::ChunkCountMismatch { .. } => StatusCode::BAD_REQUEST,
            GatewayError::SignatureMismatch => StatusCode::FORBIDDEN,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::LockBusy | GatewayError::Unavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let GatewayError::Internal(err) = &self {
            tracing::error!("internal error: {err:#}");
        }
        let body = ApiResponse::<()> {
            code: status.as_u16(),
            message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}
