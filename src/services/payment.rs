//! payment.rs
//!
//! Платёжный слой: создание заказа у внешнего шлюза и приём вебхуков.
//!
//! Ключевые компоненты:
//! 1.  **CircuitBreaker**: защита от лавины запросов к лежащему шлюзу.
//! 2.  **PaymentGatewayClient**: все сетевые вызовы к шлюзу с токенами
//!     на SHA-256 и таймаутами, через Circuit Breaker.
//! 3.  **PaymentService**: верификация вебхука по HMAC-SHA256 от сырых
//!     байт тела и диспетчеризация в координатор бронирований.
//!     Подтверждение идемпотентно; транзиентные сбои сигнализируются
//!     провайдеру кодом 5xx для повторной доставки.

use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::{
    config::PaymentConfig,
    database::Database,
    error::{ApiError, Result},
    models::{booking::booking_status, Booking},
    services::bookings::{BookingCoordinator, ConfirmOutcome},
};

/// Имя шлюза, записываемое в `bookings.payment_gateway`.
const GATEWAY_NAME: &str = "gateway";

// --- Circuit Breaker ---

/// Состояния "Автоматического выключателя".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Нормальный режим, запросы разрешены.
    Closed,
    /// Запросы заблокированы после серии сбоев.
    Open,
    /// Пробный запрос после таймаута блокировки.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    timeout_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                last_failure: None,
            }),
            failure_count: AtomicU32::new(0),
            failure_threshold,
            timeout_duration: Duration::from_secs(timeout_seconds),
        }
    }

    /// Можно ли выполнить следующий запрос к шлюзу.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.timeout_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker transitioning to HalfOpen state");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                self.failure_count.store(0, Ordering::Relaxed);
                info!("Circuit breaker recovered - transitioning to Closed state");
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    error!(
                        "Circuit breaker OPENED - {} failures reached threshold {}",
                        failures, self.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!("Circuit breaker test failed - returning to Open state");
            }
            CircuitState::Open => {}
        }
    }

    pub fn get_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn failures(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum GatewayError {
    /// Circuit Breaker разомкнут, запрос не отправлялся.
    Open,
    Transport(reqwest::Error),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Open => {
                write!(f, "circuit breaker is open - payment gateway temporarily unavailable")
            }
            GatewayError::Transport(e) => write!(f, "payment gateway error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

// --- Модели API платёжного шлюза ---

#[derive(Debug, Serialize)]
struct GatewayInitRequest {
    #[serde(rename = "teamSlug")]
    team_slug: String,
    token: String,
    amount: i64,
    #[serde(rename = "orderId")]
    order_id: String,
    currency: String,
    description: String,
    #[serde(rename = "successURL")]
    success_url: String,
    #[serde(rename = "failURL")]
    fail_url: String,
    #[serde(rename = "notificationURL")]
    notification_url: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayInitResponse {
    pub success: bool,
    #[serde(rename = "paymentURL")]
    pub payment_url: Option<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<String>,
    pub code: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct GatewayCheckRequest {
    #[serde(rename = "teamSlug")]
    team_slug: String,
    token: String,
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GatewayCheckResponse {
    pub success: bool,
    pub status: Option<String>,
    #[serde(rename = "paymentId")]
    pub payment_id: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    #[serde(rename = "orderId")]
    pub order_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct GatewayConfirmRequest {
    #[serde(rename = "teamSlug")]
    team_slug: String,
    token: String,
    #[serde(rename = "paymentId")]
    payment_id: String,
    amount: i64,
    currency: String,
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfirmResponse {
    pub success: bool,
    pub message: Option<String>,
}

/// Клиент API платёжного шлюза.
pub struct PaymentGatewayClient {
    team_slug: String,
    password: String,
    base_url: String,
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
}

impl PaymentGatewayClient {
    pub fn from_config(config: &PaymentConfig, failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            team_slug: config.merchant_id.clone(),
            password: config.merchant_password.clone(),
            base_url: config.gateway_url.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            circuit_breaker: CircuitBreaker::new(failure_threshold, timeout_seconds),
        }
    }

    async fn execute_with_circuit_breaker<F, T>(&self, operation: F) -> std::result::Result<T, GatewayError>
    where
        F: std::future::Future<Output = std::result::Result<T, reqwest::Error>>,
    {
        if !self.circuit_breaker.can_execute() {
            warn!("Circuit breaker is OPEN - blocking payment gateway request");
            return Err(GatewayError::Open);
        }

        match operation.await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                error!("Payment gateway request failed: {:?}", e);
                self.circuit_breaker.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    /// Токен запроса: SHA-256 от конкатенации полей с секретом продавца.
    fn generate_order_token(&self, amount: i64, currency: &str, order_id: &str) -> String {
        let token_string = format!(
            "{}{}{}{}{}",
            amount, currency, order_id, self.password, self.team_slug
        );
        let mut hasher = Sha256::new();
        hasher.update(token_string.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn generate_check_token(&self, order_id: &str) -> String {
        let token_string = format!("{}{}{}", order_id, self.password, self.team_slug);
        let mut hasher = Sha256::new();
        hasher.update(token_string.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Создаёт платёж (заказ) на стороне шлюза.
    pub async fn create_payment(
        &self,
        amount: i64,
        currency: &str,
        order_id: String,
        description: String,
        email: Option<String>,
        config: &PaymentConfig,
    ) -> std::result::Result<GatewayInitResponse, GatewayError> {
        let token = self.generate_order_token(amount, currency, &order_id);
        let request = GatewayInitRequest {
            team_slug: self.team_slug.clone(),
            token,
            amount,
            order_id,
            currency: currency.to_string(),
            description,
            success_url: config.success_url.clone(),
            fail_url: config.fail_url.clone(),
            notification_url: config.webhook_url.clone(),
            email,
        };

        info!("Creating payment order: amount={}, currency={}", amount, currency);

        let operation = async {
            self.http_client
                .post(format!("{}/api/v1/PaymentInit/init", self.base_url))
                .json(&request)
                .send()
                .await?
                .json::<GatewayInitResponse>()
                .await
        };

        self.execute_with_circuit_breaker(operation).await
    }

    /// Проверяет состояние заказа по merchant order id.
    pub async fn check_payment_status(
        &self,
        order_id: &str,
    ) -> std::result::Result<GatewayCheckResponse, GatewayError> {
        let request = GatewayCheckRequest {
            team_slug: self.team_slug.clone(),
            token: self.generate_check_token(order_id),
            order_id: order_id.to_string(),
        };

        let operation = async {
            self.http_client
                .post(format!("{}/api/v1/PaymentCheck/check", self.base_url))
                .json(&request)
                .send()
                .await?
                .json::<GatewayCheckResponse>()
                .await
        };

        self.execute_with_circuit_breaker(operation).await
    }

    /// Списывает авторизованный платёж.
    pub async fn confirm_payment(
        &self,
        payment_id: &str,
        amount: i64,
        currency: &str,
        order_id: &str,
    ) -> std::result::Result<GatewayConfirmResponse, GatewayError> {
        let request = GatewayConfirmRequest {
            team_slug: self.team_slug.clone(),
            token: self.generate_order_token(amount, currency, order_id),
            payment_id: payment_id.to_string(),
            amount,
            currency: currency.to_string(),
            order_id: order_id.to_string(),
        };

        let operation = async {
            self.http_client
                .post(format!("{}/api/v1/PaymentConfirm/confirm", self.base_url))
                .json(&request)
                .send()
                .await?
                .json::<GatewayConfirmResponse>()
                .await
        };

        self.execute_with_circuit_breaker(operation).await
    }

    pub fn circuit_breaker_status(&self) -> (CircuitState, u32) {
        (self.circuit_breaker.get_state(), self.circuit_breaker.failures())
    }
}

// --- Верификация вебхука ---

type HmacSha256 = Hmac<Sha256>;

/// Подпись вебхука: HMAC-SHA256 от сырых байт тела, hex-кодированная.
pub fn sign_webhook(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Сверка подписи. `verify_slice` сравнивает за константное время.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Сумма в минорных единицах (тиыны/копейки) из Decimal.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::from(100)).round().to_i64()
}

/// Совпадает ли сумма вебхука (в минорных единицах) с суммой бронирования
/// с допуском 0.01: частичные списания отклоняются.
pub fn amounts_match(minor_units: i64, total: Decimal) -> bool {
    let received = Decimal::from(minor_units) / Decimal::from(100);
    (received - total).abs() <= Decimal::new(1, 2)
}

/// Распознанное событие вебхука. Поля, кроме вида события, опциональны:
/// посторонние события принимаются и игнорируются, не падая на парсинге.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(rename = "orderId")]
    pub order_id: Option<String>,
    #[serde(rename = "paymentId")]
    pub payment_id: Option<String>,
    /// Сумма в минорных единицах валюты.
    pub amount: Option<i64>,
    pub currency: Option<String>,
}

/// Исход обработки вебхука; все варианты отвечаются кодом 200.
#[derive(Debug)]
pub enum WebhookOutcome {
    Confirmed { booking_id: i64 },
    AlreadyConfirmed { booking_id: i64 },
    MarkedFailed { booking_id: i64 },
    /// Событие принято, но действий не требует (неизвестный заказ,
    /// постороннее событие, непроходящая бизнес-проверка).
    Ignored { reason: String },
}

// --- Сервис ---

#[derive(Clone)]
pub struct PaymentService {
    db: Database,
    client: std::sync::Arc<PaymentGatewayClient>,
    coordinator: BookingCoordinator,
    config: PaymentConfig,
}

impl PaymentService {
    pub fn new(
        db: Database,
        client: std::sync::Arc<PaymentGatewayClient>,
        coordinator: BookingCoordinator,
        config: PaymentConfig,
    ) -> Self {
        Self {
            db,
            client,
            coordinator,
            config,
        }
    }

    pub fn circuit_breaker_status(&self) -> (CircuitState, u32) {
        self.client.circuit_breaker_status()
    }

    // --- Создание заказа ---

    /// Создаёт заказ у провайдера для pending-бронирования владельца.
    /// Сумма запроса обязана сойтись с суммой бронирования (допуск 0.01).
    pub async fn create_order(
        &self,
        booking_id: i64,
        user_id: i64,
        amount: Decimal,
        currency: &str,
    ) -> Result<Value> {
        let booking = self.fetch_booking(booking_id).await?;
        if booking.user_id != user_id {
            return Err(ApiError::NotFound("Booking not found".to_string()));
        }
        if booking.status != booking_status::PENDING {
            return Err(ApiError::Conflict(
                "Booking is not pending payment".to_string(),
            ));
        }
        if !booking.is_payment_window_open(chrono::Utc::now()) {
            return Err(ApiError::Stale(
                "Booking has expired. Please create a new booking.".to_string(),
            ));
        }
        if (amount - booking.total_amount).abs() > Decimal::new(1, 2) {
            return Err(ApiError::Validation(
                "Amount does not match booking total".to_string(),
            ));
        }
        if currency != self.config.currency {
            return Err(ApiError::Validation(format!(
                "Unsupported currency, expected {}",
                self.config.currency
            )));
        }

        let minor = to_minor_units(booking.total_amount)
            .ok_or_else(|| ApiError::Internal("amount out of range".to_string()))?;
        let order_id = format!("order-{}-{}", booking.id, chrono::Utc::now().timestamp());
        let description = format!("Booking {}", booking.reference);

        let email: Option<String> =
            sqlx::query_scalar("SELECT email FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.db.pool)
                .await
                .ok()
                .flatten();

        let response = self
            .client
            .create_payment(
                minor,
                &self.config.currency,
                order_id.clone(),
                description,
                email,
                &self.config,
            )
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "payment gateway rejected the order".to_string());
            error!(
                "gateway rejected order for booking {}: code={:?} {}",
                booking.reference, response.code, message
            );
            return Err(ApiError::Internal(message));
        }

        // Id заказа провайдера живёт в payment_id, пока подтверждение
        // не перепишет его на id самого платежа.
        let updated = sqlx::query(
            "UPDATE bookings SET payment_id = $2, payment_gateway = $3
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(booking.id)
        .bind(&order_id)
        .bind(GATEWAY_NAME)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(ApiError::Conflict(
                "Booking changed state while creating the order".to_string(),
            ));
        }

        info!(
            "Payment order {} created for booking {} ({} {})",
            order_id, booking.reference, booking.total_amount, self.config.currency
        );

        Ok(json!({
            "order_id": order_id,
            "amount_minor_units": minor,
            "currency": self.config.currency,
            "expiry": response.expires_at,
            "payment_url": response.payment_url,
        }))
    }

    // --- Вебхук ---

    /// Обрабатывает сырой вебхук: подпись, парсинг, диспетчеризация.
    ///
    /// Возвращает `Err(PaymentVerificationFailed)` на плохой подписи
    /// (ответ 400, провайдер не ретраит), `Err(Internal)` на транзиентном
    /// сбое (ответ 5xx - провайдер повторит доставку), иначе `Ok` и 200.
    pub async fn handle_webhook(&self, raw_body: &[u8], signature: &str) -> Result<WebhookOutcome> {
        if !verify_webhook_signature(&self.config.webhook_secret, raw_body, signature) {
            warn!("webhook signature verification failed");
            return Err(ApiError::PaymentVerificationFailed(
                "Invalid webhook signature".to_string(),
            ));
        }

        let event: WebhookEvent = serde_json::from_slice(raw_body)
            .map_err(|e| ApiError::Validation(format!("Malformed webhook payload: {}", e)))?;

        info!(
            "Webhook received: event={}, order_id={:?}, payment_id={:?}",
            event.event, event.order_id, event.payment_id
        );

        match event.event.as_str() {
            // captured и authorized означают одно: деньги подтверждены.
            "payment.captured" | "payment.authorized" => self.confirm_from_webhook(&event).await,
            "payment.failed" => self.mark_failed(&event).await,
            other => Ok(WebhookOutcome::Ignored {
                reason: format!("event {} requires no action", other),
            }),
        }
    }

    async fn confirm_from_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let (Some(order_id), Some(payment_id), Some(amount)) =
            (event.order_id.as_deref(), event.payment_id.as_deref(), event.amount)
        else {
            return Err(ApiError::Validation(
                "Webhook payload is missing orderId, paymentId or amount".to_string(),
            ));
        };

        let booking = match self.find_booking_by_order(order_id).await? {
            Some(b) => b,
            None => {
                warn!("webhook for unknown order {}", order_id);
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("unknown order {}", order_id),
                });
            }
        };

        if !amounts_match(amount, booking.total_amount) {
            warn!(
                "webhook amount {} does not match booking {} total {}",
                amount, booking.reference, booking.total_amount
            );
            return Ok(WebhookOutcome::Ignored {
                reason: "amount mismatch".to_string(),
            });
        }

        match self
            .coordinator
            .confirm_booking(booking.id, payment_id, GATEWAY_NAME)
            .await
        {
            Ok(ConfirmOutcome::Confirmed { booking, .. }) => {
                Ok(WebhookOutcome::Confirmed { booking_id: booking.id })
            }
            Ok(ConfirmOutcome::AlreadyConfirmed(booking)) => {
                Ok(WebhookOutcome::AlreadyConfirmed { booking_id: booking.id })
            }
            // Транзиентный сбой идёт наверх как 5xx: провайдер повторит.
            Err(e) if e.is_transient() => Err(e),
            // Бизнес-отказ (истекло, отменено) ретраями не лечится.
            Err(e) => {
                warn!(
                    "webhook confirmation rejected for booking {}: {}",
                    booking.reference, e
                );
                Ok(WebhookOutcome::Ignored {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn mark_failed(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let Some(order_id) = event.order_id.as_deref() else {
            return Err(ApiError::Validation(
                "Webhook payload is missing orderId".to_string(),
            ));
        };

        let booking = match self.find_booking_by_order(order_id).await? {
            Some(b) => b,
            None => {
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("unknown order {}", order_id),
                })
            }
        };

        sqlx::query(
            "UPDATE bookings SET payment_status = 'failed'
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(booking.id)
        .execute(&self.db.pool)
        .await?;

        info!("Booking {} marked payment_status=failed", booking.reference);
        Ok(WebhookOutcome::MarkedFailed { booking_id: booking.id })
    }

    // --- Поллинг статуса (запасной путь для клиента) ---

    /// Проверяет заказ владельца; для зависшего pending дополнительно
    /// опрашивает шлюз и автоподтверждает авторизованный платёж.
    pub async fn verify_order(&self, order_id: &str, user_id: i64) -> Result<Value> {
        let booking = self
            .find_booking_by_order(order_id)
            .await?
            .filter(|b| b.user_id == user_id)
            .ok_or_else(|| ApiError::NotFound("Payment order not found".to_string()))?;

        if booking.status != booking_status::PENDING {
            return Ok(json!({
                "order_id": order_id,
                "booking_id": booking.id,
                "booking_status": booking.status,
                "payment_status": booking.payment_status,
            }));
        }

        let check = self
            .client
            .check_payment_status(order_id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let mut status_label = booking.status.clone();
        let mut pay_status = booking.payment_status.clone();

        if check.success {
            match check.status.as_deref() {
                Some("CONFIRMED") => {
                    if let Some(payment_id) = check.payment_id.as_deref() {
                        if let Ok(outcome) = self
                            .coordinator
                            .confirm_booking(booking.id, payment_id, GATEWAY_NAME)
                            .await
                        {
                            let b = match outcome {
                                ConfirmOutcome::Confirmed { booking, .. } => booking,
                                ConfirmOutcome::AlreadyConfirmed(b) => b,
                            };
                            status_label = b.status;
                            pay_status = b.payment_status;
                        }
                    }
                }
                Some("AUTHORIZED") => {
                    // Списываем авторизованный платёж и подтверждаем.
                    if let (Some(payment_id), Some(amount), Some(currency)) =
                        (check.payment_id.as_deref(), check.amount, check.currency.as_deref())
                    {
                        let confirmed = self
                            .client
                            .confirm_payment(payment_id, amount, currency, order_id)
                            .await;
                        if matches!(confirmed, Ok(ref r) if r.success) {
                            if let Ok(outcome) = self
                                .coordinator
                                .confirm_booking(booking.id, payment_id, GATEWAY_NAME)
                                .await
                            {
                                let b = match outcome {
                                    ConfirmOutcome::Confirmed { booking, .. } => booking,
                                    ConfirmOutcome::AlreadyConfirmed(b) => b,
                                };
                                status_label = b.status;
                                pay_status = b.payment_status;
                                info!("Auto-confirmed payment {} during status check", payment_id);
                            }
                        }
                    }
                }
                Some("FAILED") | Some("CANCELLED") | Some("EXPIRED") => {
                    sqlx::query(
                        "UPDATE bookings SET payment_status = 'failed'
                         WHERE id = $1 AND status = 'pending'",
                    )
                    .bind(booking.id)
                    .execute(&self.db.pool)
                    .await?;
                    pay_status = "failed".to_string();
                }
                _ => {}
            }
        }

        Ok(json!({
            "order_id": order_id,
            "booking_id": booking.id,
            "booking_status": status_label,
            "payment_status": pay_status,
        }))
    }

    // --- Вспомогательные запросы ---

    async fn fetch_booking(&self, booking_id: i64) -> Result<Booking> {
        self.coordinator.get_booking(booking_id).await
    }

    async fn find_booking_by_order(&self, order_id: &str) -> Result<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(
            "SELECT id, reference, event_id, user_id, total_amount, status,
                    payment_status, payment_id, payment_gateway, booked_at,
                    confirmed_at, cancelled_at, cancellation_reason, expires_at
             FROM bookings WHERE payment_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(booking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_roundtrip_verifies() {
        let secret = "whsec_test";
        let body = br#"{"event":"payment.captured","orderId":"order-1-1","paymentId":"pay_X","amount":50000}"#;
        let signature = sign_webhook(secret, body);
        assert!(verify_webhook_signature(secret, body, &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = "whsec_test";
        let body = b"{\"amount\":50000}";
        let signature = sign_webhook(secret, body);
        assert!(!verify_webhook_signature(secret, b"{\"amount\":99999}", &signature));
        assert!(!verify_webhook_signature("other_secret", body, &signature));
        assert!(!verify_webhook_signature(secret, body, "not-hex"));
    }

    #[test]
    fn minor_units_conversion() {
        assert_eq!(to_minor_units(dec!(500.00)), Some(50000));
        assert_eq!(to_minor_units(dec!(0.01)), Some(1));
        assert_eq!(to_minor_units(dec!(123.456)), Some(12346));
    }

    #[test]
    fn amounts_match_within_tolerance() {
        assert!(amounts_match(50000, dec!(500.00)));
        assert!(amounts_match(50001, dec!(500.00)));
        assert!(!amounts_match(49900, dec!(500.00)));
        assert!(!amounts_match(25000, dec!(500.00)));
    }

    #[test]
    fn webhook_event_parses_wire_shape() {
        let raw = br#"{"event":"payment.captured","orderId":"order-7-1722500000","paymentId":"pay_X","amount":50000,"currency":"KZT"}"#;
        let event: WebhookEvent = serde_json::from_slice(raw).unwrap();
        assert_eq!(event.event, "payment.captured");
        assert_eq!(event.order_id.as_deref(), Some("order-7-1722500000"));
        assert_eq!(event.payment_id.as_deref(), Some("pay_X"));
        assert_eq!(event.amount, Some(50000));
    }

    #[test]
    fn foreign_event_without_payment_fields_still_parses() {
        let raw = br#"{"event":"refund.created","entity":{"id":"rfnd_1"}}"#;
        let event: WebhookEvent = serde_json::from_slice(raw).unwrap();
        assert_eq!(event.event, "refund.created");
        assert!(event.order_id.is_none());
        assert!(event.amount.is_none());
    }

    fn test_payment_config(gateway_url: String) -> PaymentConfig {
        PaymentConfig {
            gateway_url,
            merchant_id: "team-test".to_string(),
            merchant_password: "merchant-pass".to_string(),
            webhook_secret: "whsec_test".to_string(),
            success_url: "http://localhost/success".to_string(),
            fail_url: "http://localhost/fail".to_string(),
            webhook_url: "http://localhost/webhook".to_string(),
            currency: "KZT".to_string(),
        }
    }

    #[tokio::test]
    async fn gateway_client_creates_payment_against_mock() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/PaymentInit/init"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "paymentURL": "https://pay.example/p/abc",
                "expiresAt": "2026-08-01T15:00:00Z"
            })))
            .mount(&server)
            .await;

        let config = test_payment_config(server.uri());
        let client = PaymentGatewayClient::from_config(&config, 5, 60);
        let response = client
            .create_payment(
                50000,
                "KZT",
                "order-1-1722500000".to_string(),
                "Booking BKG-2026-0801-143000-A3F2".to_string(),
                None,
                &config,
            )
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(
            response.payment_url.as_deref(),
            Some("https://pay.example/p/abc")
        );
    }

    #[tokio::test]
    async fn breaker_blocks_after_gateway_failures() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = test_payment_config(server.uri());
        let client = PaymentGatewayClient::from_config(&config, 1, 60);

        let first = client.check_payment_status("order-1-1722500000").await;
        assert!(matches!(first, Err(GatewayError::Transport(_))));

        // Порог 1: выключатель разомкнулся, второй запрос в сеть не идёт.
        let second = client.check_payment_status("order-1-1722500000").await;
        assert!(matches!(second, Err(GatewayError::Open)));
    }

    #[test]
    fn breaker_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(3, 0);
        assert!(breaker.can_execute());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);

        // Нулевой таймаут: следующий вызов переводит в HalfOpen.
        assert!(breaker.can_execute());
        assert_eq!(breaker.get_state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.get_state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, 0);
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);
    }
}
