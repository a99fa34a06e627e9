use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Failures of the persistence collaborator. Never shown to clients as-is:
/// request-path callers fold these into the nearest fail-closed [`AccessError`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Every way the access-control layer can stop a request.
///
/// Each variant maps to exactly one HTTP status and a stable machine-readable
/// code. `InvalidCredential` deliberately covers unknown, inactive and expired
/// keys alike.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Invalid or missing CSRF token")]
    InvalidCsrfToken,

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: u64, message: String },

    #[error("API key hourly quota exceeded")]
    QuotaExceeded { retry_after: u64 },

    #[error("Invalid API key")]
    InvalidCredential,

    #[error("Insufficient permission: {0}")]
    InsufficientPermission(String),

    #[error("API key not found")]
    KeyNotFound,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl AccessError {
    pub fn rate_limited(retry_after: u64) -> Self {
        AccessError::RateLimitExceeded {
            retry_after,
            message: format!(
                "Too many attempts. Please try again in {}.",
                crate::rate_limit::format_duration(retry_after)
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AccessError::InvalidCsrfToken => StatusCode::FORBIDDEN,
            AccessError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AccessError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AccessError::InvalidCredential => StatusCode::UNAUTHORIZED,
            AccessError::InsufficientPermission(_) => StatusCode::FORBIDDEN,
            AccessError::KeyNotFound => StatusCode::NOT_FOUND,
            AccessError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AccessError::InvalidCsrfToken => "invalid_csrf_token",
            AccessError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AccessError::QuotaExceeded { .. } => "quota_exceeded",
            AccessError::InvalidCredential => "invalid_credential",
            AccessError::InsufficientPermission(_) => "insufficient_permission",
            AccessError::KeyNotFound => "key_not_found",
            AccessError::Store(_) => "internal_error",
        }
    }

    /// Seconds the client should wait, when the rejection is time-bound.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AccessError::RateLimitExceeded { retry_after, .. }
            | AccessError::QuotaExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable JSON body. Carries no internal detail beyond the error class.
    pub fn body(&self) -> Value {
        match self {
            AccessError::InvalidCsrfToken => json!({
                "error": "Invalid or missing CSRF token",
                "message": "Reload the page and submit the form again.",
                "code": self.code(),
            }),
            AccessError::RateLimitExceeded {
                retry_after,
                message,
            } => json!({
                "error": "Rate limit exceeded",
                "message": message,
                "retry_after": retry_after,
                "code": self.code(),
            }),
            AccessError::QuotaExceeded { retry_after } => json!({
                "error": "Rate limit exceeded",
                "message": format!(
                    "API key hourly quota exhausted. Try again in {}.",
                    crate::rate_limit::format_duration(*retry_after)
                ),
                "retry_after": retry_after,
                "code": self.code(),
            }),
            AccessError::InvalidCredential => json!({
                "error": "Invalid or missing API key",
                "message": "Provide a valid key via X-API-Key or Authorization: Bearer.",
                "code": self.code(),
            }),
            AccessError::InsufficientPermission(permission) => json!({
                "error": "Insufficient permission",
                "message": format!("This action requires the '{}' permission.", permission),
                "code": self.code(),
            }),
            AccessError::KeyNotFound => json!({
                "error": "API key not found",
                "message": "The key does not exist or is no longer active.",
                "code": self.code(),
            }),
            AccessError::Store(_) => json!({
                "error": "Internal error",
                "message": "The request could not be completed.",
                "code": self.code(),
            }),
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after();
        let mut response = (status, Json(self.body())).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<AccessError> for StatusCode {
    fn from(err: AccessError) -> Self {
        err.status()
    }
}

pub type AccessResult<T> = Result<T, AccessError>;
