//! error.rs
//!
//! Единая таксономия ошибок ядра бронирования.
//!
//! Каждая ошибка несёт стабильный ASCII-код для клиента и отображается
//! в HTTP-статус на границе API. Внутренние слои возвращают `Result` с
//! этим типом; перевод в HTTP происходит в одном месте (`IntoResponse`).

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Token has been revoked")]
    AuthRevoked,

    #[error("{0}")]
    NotFound(String),

    /// Место занято, бронирование уже подтверждено и т.п.
    #[error("{0}")]
    Conflict(String),

    /// Блокировка истекла или принадлежит другому пользователю.
    #[error("{0}")]
    Stale(String),

    #[error("Too many requests")]
    RateLimited,

    /// Конкурирующий запрос с тем же ключом идемпотентности ещё выполняется.
    #[error("Another request with this idempotency key is in flight")]
    InFlight,

    #[error("{0}")]
    PaymentVerificationFailed(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Стабильный код ошибки для клиентов (не меняется между релизами).
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthRevoked => "AUTH_REVOKED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Stale(_) => "STALE",
            Self::RateLimited => "RATE_LIMITED",
            Self::InFlight => "IN_FLIGHT",
            Self::PaymentVerificationFailed(_) => "PAYMENT_VERIFICATION_FAILED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AuthRequired | Self::AuthRevoked => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InFlight => StatusCode::CONFLICT,
            Self::Stale(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            // Подпись не сошлась: отвечаем 400, провайдер не будет ретраить.
            Self::PaymentVerificationFailed(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Транзиентная ли ошибка с точки зрения платёжного провайдера:
    /// на такие вебхук отвечает 5xx, чтобы провайдер повторил доставку.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            // Корреляционный id: в журнале и в ответе один и тот же.
            let correlation_id = uuid::Uuid::new_v4();
            tracing::error!(%correlation_id, "internal error: {}", self);
            let body = Json(json!({
                "code": self.code(),
                "message": self.to_string(),
                "correlation_id": correlation_id,
            }));
            return (status, body).into_response();
        }
        let body = Json(json!({
            "code": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            other => ApiError::Internal(format!("database error: {}", other)),
        }
    }
}

impl From<redis::RedisError> for ApiError {
    fn from(e: redis::RedisError) -> Self {
        ApiError::Internal(format!("kv store error: {}", e))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Internal(format!("serialization error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(ApiError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(ApiError::Stale("x".into()).code(), "STALE");
        assert_eq!(ApiError::InFlight.code(), "IN_FLIGHT");
        assert_eq!(ApiError::Internal("x".into()).code(), "INTERNAL");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::Conflict("taken".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Stale("expired".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::InFlight.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::AuthRevoked.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn only_internal_is_transient() {
        assert!(ApiError::Internal("db down".into()).is_transient());
        assert!(!ApiError::Conflict("taken".into()).is_transient());
        assert!(!ApiError::PaymentVerificationFailed("sig".into()).is_transient());
    }
}
