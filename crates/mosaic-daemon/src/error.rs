//! HTTP error taxonomy.
//!
//! Every failure a client can observe maps to one of these variants; the
//! response body never leaks internal detail. `TooSoon` is the only variant
//! carrying data the client acts on: the earliest retry time.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use mosaic_core::identity::IdentityError;
use mosaic_core::ratelimit::RateLimitError;
use mosaic_core::store::CanvasError;

/// Client-visible request failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Malformed or out-of-range input; the client must correct it, not
    /// retry.
    #[error("bad request")]
    BadRequest,

    /// Missing, invalid or mismatched identity; the client must re-register.
    #[error("missing or invalid identity")]
    Forbidden,

    /// The identity's cooldown has not elapsed; retry at `retry_at`.
    #[error("cooldown not elapsed")]
    TooSoon { retry_at: i64 },

    /// IP-level volume cap; the client should back off.
    #[error("too many requests")]
    TooManyRequests,

    /// The requested resource has no record.
    #[error("not found")]
    NotFound,

    /// A collaborator (fraud check or history store) is unreachable.
    #[error("upstream unavailable")]
    UpstreamUnavailable,

    /// Anything else. Detail is logged server-side, never returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::TooSoon { .. } | Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            // The retry time is the one payload a throttled client needs.
            Self::TooSoon { retry_at } => {
                (status, Json(json!({ "next": retry_at }))).into_response()
            },
            Self::Internal(detail) => {
                tracing::error!(detail, "internal error");
                (status, "internal server error").into_response()
            },
            Self::BadRequest => (status, "bad request").into_response(),
            Self::Forbidden => (status, "forbidden").into_response(),
            Self::TooManyRequests => (status, "too many requests").into_response(),
            Self::NotFound => (status, "not found").into_response(),
            Self::UpstreamUnavailable => (status, "upstream unavailable").into_response(),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::TooSoon { retry_at } => Self::TooSoon { retry_at },
            RateLimitError::TooManyRequests => Self::TooManyRequests,
        }
    }
}

impl From<CanvasError> for ApiError {
    fn from(_: CanvasError) -> Self {
        Self::BadRequest
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Invalid => Self::Forbidden,
            IdentityError::Signing(inner) => Self::Internal(inner.to_string()),
        }
    }
}
