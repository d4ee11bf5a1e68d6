//! Pipeline error taxonomy with retry classification.
//!
//! Every failure the proxy pipeline can surface maps to one variant here;
//! the variant decides the client-facing status code, the machine-readable
//! `errorCode`, and whether the forward loop may try another provider.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Non-standard status used for client-cancelled requests.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid or missing API key")]
    Unauthenticated,

    #[error("User is disabled or expired")]
    UserDisabled,

    #[error("API key is disabled or expired")]
    KeyExpired,

    #[error("Client is not allowed for this user: {user_agent}")]
    ClientNotAllowed { user_agent: String },

    #[error("{message}")]
    RateLimited {
        message: String,
        /// Which subject/window tripped, e.g. `key_five_hour`.
        scope: String,
        current: f64,
        limit: f64,
    },

    #[error("Request blocked by content policy")]
    PolicyBlocked,

    #[error("No provider available for model {model}")]
    NoProviderAvailable { model: String },

    #[error("Upstream returned {status}: {message}")]
    Upstream4xx { status: u16, message: String },

    #[error("Upstream returned {status}: {message}")]
    Upstream5xx { status: u16, message: String },

    #[error("Upstream timed out: {message}")]
    UpstreamTimeout { message: String },

    #[error("Connection to upstream failed: {message}")]
    ConnectionError { message: String },

    #[error("Failed to translate between API formats: {message}")]
    TranslationError { message: String },

    #[error("Client cancelled the request")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Whether the forward loop may retry this failure on another provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream5xx { .. } | Self::UpstreamTimeout { .. } | Self::ConnectionError { .. }
        )
    }

    /// Whether this failure counts against the provider's circuit breaker.
    ///
    /// Client-induced 4xx never count; network errors count only when the
    /// deployment opts in (checked by the caller).
    pub fn is_breaker_failure(&self, count_network_errors: bool) -> bool {
        match self {
            Self::Upstream5xx { .. } | Self::UpstreamTimeout { .. } => true,
            Self::ConnectionError { .. } => count_network_errors,
            _ => false,
        }
    }

    /// Machine-readable error code for the uniform error body.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::UserDisabled => "user_disabled",
            Self::KeyExpired => "key_expired",
            Self::ClientNotAllowed { .. } => "client_not_allowed",
            Self::RateLimited { .. } => "rate_limited",
            Self::PolicyBlocked => "policy_blocked",
            Self::NoProviderAvailable { .. } => "no_provider_available",
            Self::Upstream4xx { .. } => "upstream_4xx",
            Self::Upstream5xx { .. } => "upstream_5xx",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::ConnectionError { .. } => "connection_error",
            Self::TranslationError { .. } => "translation_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Client-facing HTTP status.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::UserDisabled | Self::KeyExpired => StatusCode::FORBIDDEN,
            Self::ClientNotAllowed { .. } | Self::PolicyBlocked => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoProviderAvailable { .. }
            | Self::TranslationError { .. }
            | Self::Upstream5xx { .. }
            | Self::UpstreamTimeout { .. }
            | Self::ConnectionError { .. } => StatusCode::BAD_GATEWAY,
            Self::Upstream4xx { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Cancelled => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured parameters for the uniform error body, when the variant
    /// carries more than a message.
    pub fn error_params(&self) -> Option<serde_json::Value> {
        match self {
            Self::RateLimited {
                scope,
                current,
                limit,
                ..
            } => Some(serde_json::json!({
                "scope": scope,
                "current": current,
                "limit": limit,
            })),
            Self::NoProviderAvailable { model } => {
                Some(serde_json::json!({ "model": model }))
            }
            Self::Upstream4xx { status, .. } | Self::Upstream5xx { status, .. } => {
                Some(serde_json::json!({ "upstream_status": status }))
            }
            _ => None,
        }
    }
}

/// Uniform JSON error body: `{ ok:false, error, errorCode, errorParams? }`.
#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
    #[serde(rename = "errorCode")]
    error_code: &'static str,
    #[serde(rename = "errorParams", skip_serializing_if = "Option::is_none")]
    error_params: Option<serde_json::Value>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            ok: false,
            error: self.to_string(),
            error_code: self.error_code(),
            error_params: self.error_params(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Map a terminal pipeline error to the status recorded in the outcome row.
pub fn outcome_status(error: &ProxyError) -> u16 {
    match error {
        ProxyError::Cancelled => STATUS_CLIENT_CLOSED_REQUEST,
        other => other.status_code().as_u16(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProxyError::Upstream5xx {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(ProxyError::UpstreamTimeout {
            message: "first byte".into()
        }
        .is_retryable());
        assert!(ProxyError::ConnectionError {
            message: "refused".into()
        }
        .is_retryable());
        assert!(!ProxyError::Upstream4xx {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!ProxyError::RateLimited {
            message: "over".into(),
            scope: "key_daily".into(),
            current: 1.0,
            limit: 1.0
        }
        .is_retryable());
    }

    #[test]
    fn network_errors_trip_breaker_only_when_enabled() {
        let err = ProxyError::ConnectionError {
            message: "refused".into(),
        };
        assert!(!err.is_breaker_failure(false));
        assert!(err.is_breaker_failure(true));

        let timeout = ProxyError::UpstreamTimeout {
            message: "idle".into(),
        };
        assert!(timeout.is_breaker_failure(false));

        let client = ProxyError::Upstream4xx {
            status: 422,
            message: "bad".into(),
        };
        assert!(!client.is_breaker_failure(true));
    }

    #[test]
    fn upstream_4xx_passes_through_status() {
        let err = ProxyError::Upstream4xx {
            status: 404,
            message: "model not found".into(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(outcome_status(&err), 404);
    }

    #[test]
    fn cancelled_maps_to_499() {
        assert_eq!(outcome_status(&ProxyError::Cancelled), 499);
    }
}
