use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Which quota ceiling a denied request hit. Window denials are transient
/// (retry after the window passes); the lifetime cap is terminal for the
/// device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReason {
    Minute,
    Hour,
    Day,
    Lifetime,
}

impl QuotaReason {
    /// User-facing denial message.
    pub fn message(&self) -> &'static str {
        match self {
            QuotaReason::Minute => "Rate limit exceeded. Please wait a minute.",
            QuotaReason::Hour => "Hourly limit reached. Please wait.",
            QuotaReason::Day => "Daily limit reached. Try again tomorrow.",
            QuotaReason::Lifetime => "Demo limit reached. Please upgrade to continue.",
        }
    }

    /// Seconds until the window could admit the caller again.
    /// None for the lifetime cap, which never resets.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            QuotaReason::Minute => Some(60),
            QuotaReason::Hour => Some(3600),
            QuotaReason::Day => Some(86400),
            QuotaReason::Lifetime => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("quota exceeded")]
    QuotaExceeded {
        reason: QuotaReason,
        upgrade_url: String,
    },

    #[error("no pooled key available")]
    NoCapacity,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": {
                        "message": msg,
                        "type": "invalid_request_error",
                        "code": "validation_failed",
                    }
                }),
            ),
            AppError::InvalidToken(msg) => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": {
                        "message": msg,
                        "type": "authentication_error",
                        "code": "invalid_token",
                    }
                }),
            ),
            AppError::IdentityMismatch(msg) => (
                StatusCode::FORBIDDEN,
                json!({
                    "error": {
                        "message": msg,
                        "type": "permission_error",
                        "code": "identity_mismatch",
                    }
                }),
            ),
            // Demo-facing shape: installer clients parse `message` and `upgrade_url`.
            AppError::QuotaExceeded {
                reason,
                upgrade_url,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "Rate limit exceeded",
                    "message": reason.message(),
                    "upgrade_url": upgrade_url,
                }),
            ),
            AppError::NoCapacity => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "Service temporarily unavailable",
                    "message": "No API keys available. Please try again later.",
                }),
            ),
            AppError::Upstream(msg) => {
                tracing::warn!("upstream failure: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    json!({
                        "error": {
                            "message": msg,
                            "type": "upstream_error",
                            "code": "upstream_failed",
                        }
                    }),
                )
            }
            AppError::ServiceUnavailable(msg) => {
                tracing::error!("service unavailable: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": {
                            "message": msg,
                            "type": "service_unavailable",
                            "code": "service_unavailable",
                        }
                    }),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": {
                            "message": "internal server error",
                            "type": "internal_error",
                            "code": "internal_server_error",
                        }
                    }),
                )
            }
        };

        let mut response = (status, Json(body)).into_response();

        if let AppError::QuotaExceeded { reason, .. } = &self {
            if let Some(secs) = reason.retry_after_secs() {
                if let Ok(val) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert("retry-after", val);
                }
            }
        }

        response
    }
}
