//! API error types and responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Webhook signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - resource already exists or invalid state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No entitlement covers the request.
    #[error("insufficient credits: trial={trial_remaining}, tokens={token_balance}")]
    InsufficientCredits {
        /// Trial credits left.
        trial_remaining: u32,
        /// Token balance.
        token_balance: i64,
        /// Where to buy more, if the frontend is configured.
        purchase_url: Option<String>,
    },

    /// Too many generation requests in the current window.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until a slot frees up.
        retry_after_seconds: u64,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::InvalidSignature => {
                tracing::warn!("Webhook rejected: signature verification failed");
                (
                    StatusCode::UNAUTHORIZED,
                    "invalid_signature",
                    self.to_string(),
                    None,
                )
            }
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits {
                trial_remaining,
                token_balance,
                purchase_url,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                "No subscription, trial credits, or tokens available".to_string(),
                Some(serde_json::json!({
                    "trial_remaining": trial_remaining,
                    "token_balance": token_balance,
                    "subscription_active": false,
                    "purchase_url": purchase_url,
                })),
            ),
            Self::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("Too many generation requests, retry in {retry_after_seconds}s"),
                Some(serde_json::json!({
                    "retry_after_seconds": retry_after_seconds,
                })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
                None,
            ),
        };

        let retry_after = match &self {
            Self::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<arbor_credits_store::StoreError> for ApiError {
    fn from(err: arbor_credits_store::StoreError) -> Self {
        use arbor_credits_store::StoreError;

        match err {
            StoreError::NotFound { entity, id } => {
                Self::NotFound(format!("{entity} not found: {id}"))
            }
            StoreError::AlreadyRegistered { user_id } => {
                Self::Conflict(format!("Account already exists for user {user_id}"))
            }
            StoreError::InsufficientCredits {
                trial_remaining,
                token_balance,
            } => Self::InsufficientCredits {
                trial_remaining,
                token_balance,
                purchase_url: None,
            },
            StoreError::DuplicatePayment {
                external_payment_id,
            } => Self::Conflict(format!("Payment {external_payment_id} already credited")),
            StoreError::LockTimeout { user_id } => {
                Self::Conflict(format!("Account {user_id} is busy, retry shortly"))
            }
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}
