//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use avatarbank_core::MarketError;
use avatarbank_store::StoreError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The avatar does not exist or is not available for generation.
    #[error("avatar not found: {0}")]
    AvatarNotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - resource already exists or invalid state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A concurrent request won; nothing was committed and the call may be retried.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Insufficient credits.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Spendable balance.
        balance: i64,
        /// Required amount.
        required: i64,
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
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::AvatarNotFound(id) => (
                StatusCode::NOT_FOUND,
                "avatar_not_found",
                self.to_string(),
                Some(serde_json::json!({ "avatar_id": id })),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::ConcurrencyConflict(msg) => (
                StatusCode::CONFLICT,
                "concurrency_conflict",
                msg.clone(),
                Some(serde_json::json!({ "retryable": true })),
            ),
            Self::InsufficientCredits { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required
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

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        match err {
            MarketError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            MarketError::AvatarNotFound { avatar_id } => Self::AvatarNotFound(avatar_id),
            MarketError::UserNotFound { user_id } => {
                Self::NotFound(format!("user not found: {user_id}"))
            }
            MarketError::GenerationNotFound { generation_id } => {
                Self::NotFound(format!("generation not found: {generation_id}"))
            }
            MarketError::TaskNotFound { task_id } => {
                Self::NotFound(format!("task not found: {task_id}"))
            }
            MarketError::UserAlreadyExists { .. } | MarketError::InvalidTransition { .. } => {
                Self::Conflict(err.to_string())
            }
            MarketError::ConcurrencyConflict(msg) => Self::ConcurrencyConflict(msg),
            MarketError::InvalidAmount(_)
            | MarketError::InvalidRequest(_)
            | MarketError::InvalidId(_) => Self::BadRequest(err.to_string()),
            MarketError::ProviderFailure(_) | MarketError::ProviderTimeout { .. } => {
                Self::ExternalService(err.to_string())
            }
            MarketError::Storage(msg) | MarketError::Configuration(msg) => Self::Internal(msg),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
            StoreError::AlreadyExists { entity, id } => {
                Self::Conflict(format!("{entity} already exists: {id}"))
            }
            StoreError::NotFound { entity, id }
                if !matches!(entity, "user" | "generation" | "task" | "avatar") =>
            {
                Self::NotFound(format!("{entity} not found: {id}"))
            }
            other => MarketError::from(other).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_is_payment_required() {
        let response = ApiError::from(StoreError::InsufficientCredits {
            balance: 2,
            required: 3,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn missing_avatar_keeps_its_own_code() {
        let err = ApiError::from(StoreError::NotFound {
            entity: "avatar",
            id: "abc".into(),
        });
        assert!(matches!(err, ApiError::AvatarNotFound(ref id) if id == "abc"));
    }

    #[test]
    fn store_conflict_is_retryable() {
        let err = ApiError::from(StoreError::Conflict("serialization failure".into()));
        assert!(matches!(err, ApiError::ConcurrencyConflict(_)));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        let err = ApiError::from(MarketError::InvalidRequest("prompt must not be empty".into()));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
