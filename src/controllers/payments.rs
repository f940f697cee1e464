//! payments.rs
//!
//! Платёжные маршруты: создание заказа, вебхук, поллинг статуса.
//!
//! Вебхук принимает сырые байты тела: никакого JSON-парсинга до сверки
//! HMAC-подписи. Ответы вебхука: 200 - принято или неретраябельно,
//! 400 - плохая подпись (провайдер не ретраит), 5xx - транзиентный сбой
//! (провайдер повторит доставку).

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use crate::{
    error::{ApiError, Result},
    middleware::AuthUser,
    services::payment::WebhookOutcome,
    AppState,
};

const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments/create-order", post(create_order))
        .route("/payments/webhook", post(payment_webhook))
        .route("/payments/verify/{order_id}", get(verify_order))
        .route(
            "/payments/circuit-breaker-status",
            get(circuit_breaker_status),
        )
}

#[derive(Debug, Deserialize, Validate)]
struct CreateOrderRequest {
    #[validate(range(min = 1))]
    booking_id: i64,
    /// Сумма строкой с фиксированной точкой; двоичного float в деньгах нет.
    amount: Decimal,
    #[validate(length(min = 3, max = 3))]
    currency: String,
}

/// POST /api/v1/payments/create-order
async fn create_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse> {
    req.validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let order = state
        .payments
        .create_order(req.booking_id, user.user_id, req.amount, &req.currency)
        .await?;

    Ok((StatusCode::CREATED, Json(order)))
}

/// POST /api/v1/payments/webhook
///
/// Сырое тело + заголовок подписи. Парсинг только после верификации.
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::PaymentVerificationFailed("Missing webhook signature header".to_string())
        })?;

    let outcome = state.payments.handle_webhook(&body, signature).await?;

    let body = match outcome {
        WebhookOutcome::Confirmed { booking_id } => {
            json!({ "received": true, "status": "confirmed", "booking_id": booking_id })
        }
        WebhookOutcome::AlreadyConfirmed { booking_id } => {
            json!({ "received": true, "status": "already_confirmed", "booking_id": booking_id })
        }
        WebhookOutcome::MarkedFailed { booking_id } => {
            json!({ "received": true, "status": "failed", "booking_id": booking_id })
        }
        WebhookOutcome::Ignored { reason } => {
            json!({ "received": true, "status": "ignored", "reason": reason })
        }
    };

    Ok((StatusCode::OK, Json(body)))
}

/// GET /api/v1/payments/verify/{order_id}
///
/// Поллинг-фоллбек для клиента, не дождавшегося вебхука.
async fn verify_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse> {
    let status = state.payments.verify_order(&order_id, user.user_id).await?;
    Ok(Json(status))
}

/// GET /api/v1/payments/circuit-breaker-status
async fn circuit_breaker_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    let (circuit_state, failure_count) = state.payments.circuit_breaker_status();
    Ok(Json(json!({
        "success": true,
        "circuit_breaker": {
            "state": format!("{:?}", circuit_state),
            "failure_count": failure_count,
            "threshold": state.config.circuit_breaker.failure_threshold,
            "timeout_seconds": state.config.circuit_breaker.timeout_seconds,
        }
    })))
}
