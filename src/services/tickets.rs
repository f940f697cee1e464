//! tickets.rs
//!
//! Генератор билетов: выносит QR-пейлоады и персист билетов с критического
//! пути подтверждения оплаты.
//!
//! Очередь живёт в Postgres (`ticket_jobs`): доставка at-least-once,
//! воркеры забирают джобы через `FOR UPDATE SKIP LOCKED`, обработчики
//! идемпотентны за счёт `ON CONFLICT (ticket_id) DO UPDATE`. Три вида
//! джобов на одной очереди: генерация, затем отложенные под-джобы
//! доставки почтой и SMS.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    config::NotificationConfig,
    database::Database,
    error::{ApiError, Result},
    models::{ticket::job_status, ticket::ticket_status, Booking, Ticket, TicketJob},
    realtime::{messages::LiveEvent, EventBus},
};

pub mod job_kind {
    pub const GENERATE: &str = "generate_tickets";
    pub const SEND_EMAIL: &str = "send_email";
    pub const SEND_SMS: &str = "send_sms";
}

/// `TKT-{booking_ref}-{seat_label}` - идентификатор билета, он же стержень
/// QR-пейлоада.
pub fn ticket_id(booking_reference: &str, seat_label: &str) -> String {
    format!("TKT-{}-{}", booking_reference, seat_label)
}

/// Содержимое QR: детерминированный JSON без таймстемпов, чтобы повторная
/// генерация давала идентичные строки. Параметры рендера (высокий уровень
/// коррекции, 300px) едут в пейлоаде - растеризует клиент.
pub fn qr_payload(booking: &Booking, seat: &TicketSeat) -> String {
    json!({
        "ticket_id": ticket_id(&booking.reference, &seat.seat_label),
        "booking_reference": booking.reference,
        "event_id": booking.event_id,
        "seat_label": seat.seat_label,
        "seat_type": seat.seat_type_name,
        "render": { "error_correction": "H", "size_px": 300 },
    })
    .to_string()
}

/// Экспоненциальный бэкофф по виду джобы: база 5/10/15 секунд.
pub fn backoff_delay(kind: &str, attempt: i32) -> Duration {
    let base: i64 = match kind {
        job_kind::GENERATE => 5,
        job_kind::SEND_EMAIL => 10,
        _ => 15,
    };
    Duration::seconds(base << (attempt - 1).clamp(0, 6))
}

/// Агрегатный статус набора билетов бронирования.
pub fn aggregate_status(statuses: &[&str], job_in_progress: bool) -> &'static str {
    if statuses.is_empty() {
        return if job_in_progress { "generating" } else { "pending" };
    }
    if statuses.iter().any(|s| *s == ticket_status::FAILED) {
        return "partial";
    }
    if statuses
        .iter()
        .all(|s| *s == ticket_status::GENERATED || *s == ticket_status::DELIVERED)
    {
        return "ready";
    }
    "generating"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSeat {
    pub seat_id: i64,
    pub seat_label: String,
    pub seat_type_name: String,
    pub price_paid: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenerationPayload {
    booking_reference: String,
    event_id: i64,
    user_id: i64,
    seats: Vec<TicketSeat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeliveryPayload {
    booking_reference: String,
    contact: String,
}

const MAX_ATTEMPTS: i32 = 3;
const COMPLETED_JOBS_RETAINED: i64 = 500;
const DELIVERY_CHAIN_DELAY_SECONDS: i64 = 2;

#[derive(Clone)]
pub struct TicketService {
    db: Database,
    bus: EventBus,
    notifications: NotificationConfig,
}

impl TicketService {
    pub fn new(db: Database, bus: EventBus, notifications: NotificationConfig) -> Self {
        Self {
            db,
            bus,
            notifications,
        }
    }

    // --- Постановка джобов ---

    /// Ставит джобу генерации; ошибка означает недоступность очереди и
    /// переводит вызывающего на синхронный путь.
    pub async fn enqueue_generation(&self, booking: &Booking, seats: &[TicketSeat]) -> Result<i64> {
        let payload = serde_json::to_value(GenerationPayload {
            booking_reference: booking.reference.clone(),
            event_id: booking.event_id,
            user_id: booking.user_id,
            seats: seats.to_vec(),
        })?;

        let job_id: i64 = sqlx::query_scalar(
            "INSERT INTO ticket_jobs (kind, booking_id, payload, status, attempts, max_attempts, run_at)
             VALUES ($1, $2, $3, 'waiting', 0, $4, NOW())
             RETURNING id",
        )
        .bind(job_kind::GENERATE)
        .bind(booking.id)
        .bind(payload)
        .bind(MAX_ATTEMPTS)
        .fetch_one(&self.db.pool)
        .await?;

        Ok(job_id)
    }

    async fn enqueue_delivery(
        &self,
        kind: &str,
        booking_id: i64,
        booking_reference: &str,
        contact: String,
        delay: Duration,
    ) -> Result<i64> {
        let payload = serde_json::to_value(DeliveryPayload {
            booking_reference: booking_reference.to_string(),
            contact,
        })?;

        let job_id: i64 = sqlx::query_scalar(
            "INSERT INTO ticket_jobs (kind, booking_id, payload, status, attempts, max_attempts, run_at)
             VALUES ($1, $2, $3, 'delayed', 0, $4, $5)
             RETURNING id",
        )
        .bind(kind)
        .bind(booking_id)
        .bind(payload)
        .bind(MAX_ATTEMPTS)
        .bind(Utc::now() + delay)
        .fetch_one(&self.db.pool)
        .await?;

        Ok(job_id)
    }

    // --- Воркеры ---

    /// Цикл воркера: забирает по одной джобе через SKIP LOCKED.
    /// Остановка кооперативная: текущая джоба дорабатывается, новая
    /// не берётся.
    pub async fn run_worker(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!("Ticket worker {} started", worker_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.claim_job().await {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    if let Err(e) = self.process_job(&job).await {
                        self.handle_failure(&job, &e).await;
                        warn!("ticket job {} attempt {} failed: {}", job_id, job.attempts, e);
                    }
                }
                Ok(None) => {
                    // Пустая очередь: ждём, не выжигая соединения пула.
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!("ticket worker {} failed to poll queue: {}", worker_id, e);
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }

        info!("Ticket worker {} stopped", worker_id);
    }

    async fn claim_job(&self) -> Result<Option<TicketJob>> {
        let job = sqlx::query_as::<_, TicketJob>(
            "UPDATE ticket_jobs
             SET status = 'active', attempts = attempts + 1, updated_at = NOW()
             WHERE id = (
                 SELECT id FROM ticket_jobs
                 WHERE status IN ('waiting', 'delayed') AND run_at <= NOW()
                 ORDER BY run_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, kind, booking_id, payload, status, attempts, max_attempts,
                       run_at, progress, result, last_error, created_at, updated_at",
        )
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(job)
    }

    async fn process_job(&self, job: &TicketJob) -> Result<()> {
        match job.kind.as_str() {
            job_kind::GENERATE => self.process_generation(job).await,
            job_kind::SEND_EMAIL => self.process_delivery(job, job_kind::SEND_EMAIL).await,
            job_kind::SEND_SMS => self.process_delivery(job, job_kind::SEND_SMS).await,
            other => {
                self.finish_job(job.id, job_status::FAILED, None, Some("unknown job kind"))
                    .await;
                Err(ApiError::Internal(format!("unknown job kind {}", other)))
            }
        }
    }

    async fn process_generation(&self, job: &TicketJob) -> Result<()> {
        let payload: GenerationPayload = serde_json::from_value(job.payload.clone())?;
        let booking = Booking {
            id: job.booking_id,
            reference: payload.booking_reference.clone(),
            event_id: payload.event_id,
            user_id: payload.user_id,
            total_amount: Decimal::ZERO,
            status: String::new(),
            payment_status: String::new(),
            payment_id: None,
            payment_gateway: None,
            booked_at: Utc::now(),
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            expires_at: Utc::now(),
        };

        let total = payload.seats.len();
        let tickets = self.persist_tickets(&booking, &payload.seats, |done| {
            let progress = (done * 100 / total.max(1)) as i32;
            let db = self.db.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                let _ = sqlx::query("UPDATE ticket_jobs SET progress = $2 WHERE id = $1")
                    .bind(job_id)
                    .bind(progress)
                    .execute(&db.pool)
                    .await;
            });
        })
        .await?;

        let result = json!({ "ticket_count": tickets.len() });
        self.finish_job(job.id, job_status::COMPLETED, Some(&result), None)
            .await;

        self.bus.publish(LiveEvent::TicketsReady {
            booking_id: job.booking_id,
            ticket_count: tickets.len() as i64,
        });

        // Под-джобы доставки с небольшой задержкой, чтобы коммит успел
        // стать видимым читателям.
        self.chain_delivery_jobs(job.booking_id, &payload).await;

        info!(
            "Generated {} tickets for booking {}",
            tickets.len(),
            payload.booking_reference
        );
        Ok(())
    }

    async fn chain_delivery_jobs(&self, booking_id: i64, payload: &GenerationPayload) {
        let contact: Option<(Option<String>, Option<String>)> =
            sqlx::query_as("SELECT email, phone FROM users WHERE id = $1")
                .bind(payload.user_id)
                .fetch_optional(&self.db.pool)
                .await
                .unwrap_or(None);

        let (email, phone) = contact.unwrap_or((None, None));
        let delay = Duration::seconds(DELIVERY_CHAIN_DELAY_SECONDS);

        if let (Some(email), Some(_)) = (email, self.notifications.email_api_key.as_ref()) {
            if let Err(e) = self
                .enqueue_delivery(
                    job_kind::SEND_EMAIL,
                    booking_id,
                    &payload.booking_reference,
                    email,
                    delay,
                )
                .await
            {
                warn!("failed to chain email job for booking {}: {}", booking_id, e);
            }
        }
        if let (Some(phone), Some(_)) = (phone, self.notifications.sms_api_key.as_ref()) {
            if let Err(e) = self
                .enqueue_delivery(
                    job_kind::SEND_SMS,
                    booking_id,
                    &payload.booking_reference,
                    phone,
                    delay,
                )
                .await
            {
                warn!("failed to chain sms job for booking {}: {}", booking_id, e);
            }
        }
    }

    async fn process_delivery(&self, job: &TicketJob, kind: &str) -> Result<()> {
        let payload: DeliveryPayload = serde_json::from_value(job.payload.clone())?;

        // Фактическая интеграция с провайдером - за пределами ядра;
        // отправка фиксируется в журнале и в строках билетов.
        info!(
            "Delivering tickets of booking {} via {} to {}",
            payload.booking_reference, kind, payload.contact
        );

        let column = if kind == job_kind::SEND_EMAIL {
            "email_sent"
        } else {
            "sms_sent"
        };
        let query = format!(
            "UPDATE tickets
             SET {} = true,
                 delivered_at = COALESCE(delivered_at, NOW()),
                 status = CASE WHEN status = 'generated' THEN 'delivered' ELSE status END
             WHERE booking_id = $1",
            column
        );
        sqlx::query(&query)
            .bind(job.booking_id)
            .execute(&self.db.pool)
            .await?;

        self.finish_job(job.id, job_status::COMPLETED, None, None).await;
        Ok(())
    }

    /// Синхронный запасной путь: очередь недоступна, билеты считаются
    /// прямо в ответе подтверждения.
    pub async fn generate_inline(
        &self,
        booking: &Booking,
        seats: &[TicketSeat],
    ) -> Result<Vec<Ticket>> {
        let tickets = self.persist_tickets(booking, seats, |_| {}).await?;
        self.bus.publish(LiveEvent::TicketsReady {
            booking_id: booking.id,
            ticket_count: tickets.len() as i64,
        });
        Ok(tickets)
    }

    /// Персист набора билетов одной транзакцией: либо весь комплект,
    /// либо ничего. Повторный прогон перезаписывает те же строки.
    async fn persist_tickets(
        &self,
        booking: &Booking,
        seats: &[TicketSeat],
        mut on_seat_done: impl FnMut(usize),
    ) -> Result<Vec<Ticket>> {
        let mut tx = self.db.pool.begin().await?;
        let mut tickets = Vec::with_capacity(seats.len());

        for (i, seat) in seats.iter().enumerate() {
            let tid = ticket_id(&booking.reference, &seat.seat_label);
            let payload = qr_payload(booking, seat);

            let ticket = sqlx::query_as::<_, Ticket>(
                "INSERT INTO tickets (booking_id, seat_id, ticket_id, seat_label,
                                      seat_type_name, price_paid, qr_payload, status,
                                      email_sent, sms_sent, generated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'generated', false, false, NOW())
                 ON CONFLICT (ticket_id) DO UPDATE
                 SET qr_payload = EXCLUDED.qr_payload,
                     status = 'generated',
                     generated_at = COALESCE(tickets.generated_at, EXCLUDED.generated_at)
                 RETURNING id, booking_id, seat_id, ticket_id, seat_label, seat_type_name,
                           price_paid, qr_payload, status, email_sent, sms_sent,
                           generated_at, delivered_at",
            )
            .bind(booking.id)
            .bind(seat.seat_id)
            .bind(&tid)
            .bind(&seat.seat_label)
            .bind(&seat.seat_type_name)
            .bind(seat.price_paid)
            .bind(&payload)
            .fetch_one(&mut *tx)
            .await?;

            tickets.push(ticket);
            on_seat_done(i + 1);
        }

        tx.commit().await?;
        Ok(tickets)
    }

    async fn finish_job(
        &self,
        job_id: i64,
        status: &str,
        result: Option<&Value>,
        last_error: Option<&str>,
    ) {
        let outcome = sqlx::query(
            "UPDATE ticket_jobs
             SET status = $2, result = $3, last_error = $4, progress = 100, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(status)
        .bind(result)
        .bind(last_error)
        .execute(&self.db.pool)
        .await;

        if let Err(e) = outcome {
            error!("failed to finish ticket job {}: {}", job_id, e);
        }
    }

    async fn handle_failure(&self, job: &TicketJob, err: &ApiError) {
        if job.attempts >= job.max_attempts {
            // Исчерпали попытки: оставляем джобу для разбора.
            let _ = sqlx::query(
                "UPDATE ticket_jobs
                 SET status = 'failed', last_error = $2, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(err.to_string())
            .execute(&self.db.pool)
            .await;
            error!(
                "ticket job {} ({}) permanently failed after {} attempts: {}",
                job.id, job.kind, job.attempts, err
            );
            return;
        }

        let retry_at = Utc::now() + backoff_delay(&job.kind, job.attempts);
        let _ = sqlx::query(
            "UPDATE ticket_jobs
             SET status = 'delayed', run_at = $2, last_error = $3, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(retry_at)
        .bind(err.to_string())
        .execute(&self.db.pool)
        .await;
    }

    // --- Статусы для API ---

    pub async fn get_job_status(&self, job_id: i64) -> Result<Value> {
        let job: Option<(String, i32, Option<Value>)> = sqlx::query_as(
            "SELECT status, progress, result FROM ticket_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.db.pool)
        .await?;

        let (state, progress, result) =
            job.ok_or_else(|| ApiError::NotFound("Job not found".to_string()))?;

        Ok(json!({
            "job_id": job_id,
            "state": state,
            "progress_percent": progress,
            "result": result,
        }))
    }

    pub async fn get_tickets(&self, booking_id: i64) -> Result<(Vec<Ticket>, &'static str)> {
        let tickets = sqlx::query_as::<_, Ticket>(
            "SELECT id, booking_id, seat_id, ticket_id, seat_label, seat_type_name,
                    price_paid, qr_payload, status, email_sent, sms_sent,
                    generated_at, delivered_at
             FROM tickets WHERE booking_id = $1
             ORDER BY seat_label",
        )
        .bind(booking_id)
        .fetch_all(&self.db.pool)
        .await?;

        let job_in_progress: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM ticket_jobs
                 WHERE booking_id = $1 AND kind = $2
                   AND status IN ('waiting', 'active', 'delayed')
             )",
        )
        .bind(booking_id)
        .bind(job_kind::GENERATE)
        .fetch_one(&self.db.pool)
        .await?;

        let statuses: Vec<&str> = tickets.iter().map(|t| t.status.as_str()).collect();
        let aggregate = aggregate_status(&statuses, job_in_progress);
        Ok((tickets, aggregate))
    }

    /// Ретенция завершённых джобов: оставляем последние N, остальным - DELETE.
    /// Провалившиеся джобы не трогаем, они нужны для разбора.
    pub async fn prune_completed_jobs(&self) -> Result<u64> {
        let removed = sqlx::query(
            "DELETE FROM ticket_jobs
             WHERE status = 'completed' AND id NOT IN (
                 SELECT id FROM ticket_jobs
                 WHERE status = 'completed'
                 ORDER BY id DESC
                 LIMIT $1
             )",
        )
        .bind(COMPLETED_JOBS_RETAINED)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ticket_id_follows_format() {
        assert_eq!(
            ticket_id("BKG-2026-0801-143000-A3F2", "V1"),
            "TKT-BKG-2026-0801-143000-A3F2-V1"
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(job_kind::GENERATE, 1), Duration::seconds(5));
        assert_eq!(backoff_delay(job_kind::GENERATE, 2), Duration::seconds(10));
        assert_eq!(backoff_delay(job_kind::GENERATE, 3), Duration::seconds(20));
        assert_eq!(backoff_delay(job_kind::SEND_EMAIL, 1), Duration::seconds(10));
        assert_eq!(backoff_delay(job_kind::SEND_SMS, 2), Duration::seconds(30));
    }

    #[test]
    fn aggregate_status_mapping() {
        assert_eq!(aggregate_status(&[], false), "pending");
        assert_eq!(aggregate_status(&[], true), "generating");
        assert_eq!(aggregate_status(&["generated", "generated"], false), "ready");
        assert_eq!(aggregate_status(&["generated", "delivered"], false), "ready");
        assert_eq!(aggregate_status(&["generated", "failed"], false), "partial");
        assert_eq!(aggregate_status(&["generated", "pending"], true), "generating");
    }

    #[test]
    fn qr_payload_is_deterministic() {
        let booking = Booking {
            id: 1,
            reference: "BKG-2026-0801-143000-A3F2".to_string(),
            event_id: 9,
            user_id: 4,
            total_amount: Decimal::ZERO,
            status: "confirmed".to_string(),
            payment_status: "completed".to_string(),
            payment_id: None,
            payment_gateway: None,
            booked_at: Utc::now(),
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            expires_at: Utc::now(),
        };
        let seat = TicketSeat {
            seat_id: 11,
            seat_label: "V1".to_string(),
            seat_type_name: "VIP".to_string(),
            price_paid: Decimal::ZERO,
        };
        assert_eq!(qr_payload(&booking, &seat), qr_payload(&booking, &seat));
        assert!(qr_payload(&booking, &seat).contains("TKT-BKG-2026-0801-143000-A3F2-V1"));
    }

    proptest! {
        // ticket_id == "TKT-" + reference + "-" + label для любых входов.
        #[test]
        fn ticket_id_concatenation_holds(
            reference in "BKG-[0-9]{4}-[0-9]{4}-[0-9]{6}-[0-9A-F]{4}",
            label in "[A-Z0-9]{1,20}",
        ) {
            let tid = ticket_id(&reference, &label);
            prop_assert_eq!(tid, format!("TKT-{}-{}", reference, label));
        }
    }
}
