//! bookings.rs
//!
//! Координатор бронирований: превращает набор удерживаемых блокировок в
//! `pending`-бронирование, подтверждает его по оплате или отменяет.
//!
//! Все переходы состояния выполняются в одной транзакции под
//! `SELECT ... FOR UPDATE`; гонки разрешаются на уровне строк БД.
//! Ошибка всегда откатывает транзакцию целиком - частичное состояние
//! не персистится никогда.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::{
    cache::CacheService,
    config::BookingConfig,
    database::Database,
    error::{ApiError, Result},
    models::{
        booking::{booking_status, payment_status},
        Booking, BookingSeatRow, Ticket,
    },
    realtime::{connection::ConnectionId, messages::LiveEvent, EventBus},
    services::{
        idempotency::{IdempotencyClaim, IdempotencyStore},
        tickets::{TicketSeat, TicketService},
    },
};

/// Одно место в запросе на бронирование.
#[derive(Debug, Clone, Deserialize)]
pub struct SeatSelection {
    pub seat_label: String,
    pub seat_type_id: i64,
}

/// Исход подтверждения: новое подтверждение (с билетами, если очередь
/// была недоступна и генерация прошла синхронно) либо повторная доставка.
#[derive(Debug)]
pub enum ConfirmOutcome {
    Confirmed {
        booking: Booking,
        tickets: Option<Vec<Ticket>>,
    },
    AlreadyConfirmed(Booking),
}

/// Человекочитаемый глобально-уникальный номер бронирования:
/// `BKG-YYYY-MMDD-HHMMSS-XXXX`, где XXXX - случайный hex-суффикс.
pub fn booking_reference(now: DateTime<Utc>, suffix: u16) -> String {
    format!("BKG-{}-{:04X}", now.format("%Y-%m%d-%H%M%S"), suffix)
}

const MAX_SEATS_PER_BOOKING: usize = 10;
const REFERENCE_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct BookingCoordinator {
    db: Database,
    cache: CacheService,
    bus: EventBus,
    idempotency: IdempotencyStore,
    tickets: TicketService,
    config: BookingConfig,
}

impl BookingCoordinator {
    pub fn new(
        db: Database,
        cache: CacheService,
        bus: EventBus,
        idempotency: IdempotencyStore,
        tickets: TicketService,
        config: BookingConfig,
    ) -> Self {
        Self {
            db,
            cache,
            bus,
            idempotency,
            tickets,
            config,
        }
    }

    // --- Создание ---

    /// Связывает свежие блокировки пользователя в `pending`-бронирование.
    pub async fn create_booking(
        &self,
        event_id: i64,
        user_id: i64,
        seats: Vec<SeatSelection>,
        origin: Option<ConnectionId>,
    ) -> Result<(Booking, Vec<BookingSeatRow>)> {
        if seats.is_empty() {
            return Err(ApiError::Validation(
                "At least one seat is required".to_string(),
            ));
        }
        if seats.len() > MAX_SEATS_PER_BOOKING {
            return Err(ApiError::Validation(format!(
                "A booking can hold at most {} seats",
                MAX_SEATS_PER_BOOKING
            )));
        }

        let mut normalized: Vec<(String, i64)> = Vec::with_capacity(seats.len());
        for s in &seats {
            let label = super::locks::validate_seat_label(&s.seat_label)?;
            if normalized.iter().any(|(l, t)| *l == label && *t == s.seat_type_id) {
                return Err(ApiError::Validation(format!(
                    "Seat {} is listed twice",
                    label
                )));
            }
            normalized.push((label, s.seat_type_id));
        }

        let deadline = StdDuration::from_secs(self.config.create_deadline_seconds);
        let (booking, rows) = timeout(
            deadline,
            self.create_booking_tx(event_id, user_id, &normalized),
        )
        .await
        .map_err(|_| ApiError::Internal("booking create deadline exceeded".to_string()))??;

        info!(
            "Booking {} created for user {} with {} seats, total {}",
            booking.reference,
            user_id,
            rows.len(),
            booking.total_amount
        );

        self.bus.publish_from(
            origin,
            LiveEvent::BookingCreated {
                booking_id: booking.id,
                event_id,
                user_id,
            },
        );

        Ok((booking, rows))
    }

    async fn create_booking_tx(
        &self,
        event_id: i64,
        user_id: i64,
        seats: &[(String, i64)],
    ) -> Result<(Booking, Vec<BookingSeatRow>)> {
        let now = Utc::now();
        let mut tx = self.db.pool.begin().await?;

        // Шаг 1: запираем и проверяем каждую заявленную блокировку.
        let mut locked: Vec<(i64, String, i64, Decimal)> = Vec::with_capacity(seats.len());
        for (label, seat_type_id) in seats {
            let row: Option<(i64, String, i64, DateTime<Utc>, Decimal)> = sqlx::query_as(
                "SELECT s.id, s.status, s.owner_user_id, s.expires_at, st.price
                 FROM seats s
                 JOIN event_seat_types st ON st.id = s.seat_type_id
                 WHERE s.event_id = $1 AND s.seat_type_id = $2 AND s.seat_label = $3
                 FOR UPDATE OF s",
            )
            .bind(event_id)
            .bind(seat_type_id)
            .bind(label)
            .fetch_optional(&mut *tx)
            .await?;

            let (seat_id, status, owner, expires_at, price) = row.ok_or_else(|| {
                ApiError::Stale(format!("Seat {} is not locked by you", label))
            })?;

            if status != crate::models::seat::seat_status::LOCKED
                || owner != user_id
                || expires_at <= now
            {
                return Err(ApiError::Stale(format!(
                    "Lock on seat {} has expired or is not yours. Please re-lock the seat.",
                    label
                )));
            }

            // Шаг 2: место не должно числиться в другом живом бронировании.
            let already_linked: bool = sqlx::query_scalar(
                "SELECT EXISTS(
                     SELECT 1 FROM booking_seats bs
                     JOIN bookings b ON b.id = bs.booking_id
                     WHERE bs.seat_id = $1 AND b.status <> 'cancelled'
                 )",
            )
            .bind(seat_id)
            .fetch_one(&mut *tx)
            .await?;
            if already_linked {
                return Err(ApiError::Conflict(format!(
                    "Seat {} is already attached to a booking",
                    label
                )));
            }

            locked.push((seat_id, label.clone(), *seat_type_id, price));
        }

        // Шаг 3: сумма по прайсу категорий.
        let total_amount: Decimal = locked.iter().map(|(_, _, _, p)| *p).sum();

        // Шаг 4-5: бронирование с уникальным номером (до 5 попыток на
        // случай коллизии суффикса).
        let expires_at = now + Duration::minutes(self.config.expiry_minutes);
        let mut booking: Option<Booking> = None;
        for _ in 0..REFERENCE_RETRIES {
            let reference = booking_reference(now, rand::random::<u16>());
            let inserted = sqlx::query_as::<_, Booking>(
                "INSERT INTO bookings (reference, event_id, user_id, total_amount,
                                       status, payment_status, booked_at, expires_at)
                 VALUES ($1, $2, $3, $4, 'pending', 'pending', $5, $6)
                 ON CONFLICT (reference) DO NOTHING
                 RETURNING id, reference, event_id, user_id, total_amount, status,
                           payment_status, payment_id, payment_gateway, booked_at,
                           confirmed_at, cancelled_at, cancellation_reason, expires_at",
            )
            .bind(&reference)
            .bind(event_id)
            .bind(user_id)
            .bind(total_amount)
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(b) = inserted {
                booking = Some(b);
                break;
            }
        }
        let booking = booking.ok_or_else(|| {
            ApiError::Internal("could not generate a unique booking reference".to_string())
        })?;

        // Шаг 6: связки место-бронирование; количество обязано сойтись.
        let mut linked = 0u64;
        for (seat_id, _, _, price) in &locked {
            linked += sqlx::query(
                "INSERT INTO booking_seats (booking_id, seat_id, price_paid)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (booking_id, seat_id) DO NOTHING",
            )
            .bind(booking.id)
            .bind(seat_id)
            .bind(price)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        if linked != locked.len() as u64 {
            return Err(ApiError::Internal(
                "booking seat linkage count mismatch".to_string(),
            ));
        }

        tx.commit().await?;

        let rows = locked
            .into_iter()
            .map(|(seat_id, seat_label, seat_type_id, price_paid)| BookingSeatRow {
                booking_id: booking.id,
                seat_id,
                seat_label,
                seat_type_id,
                price_paid,
            })
            .collect();

        Ok((booking, rows))
    }

    // --- Подтверждение ---

    /// Переводит бронирование в `confirmed` по верифицированному платежу.
    ///
    /// Идемпотентно: повторная доставка того же платежа возвращает
    /// существующее подтверждение без новых переходов.
    pub async fn confirm_booking(
        &self,
        booking_id: i64,
        payment_id: &str,
        gateway: &str,
    ) -> Result<ConfirmOutcome> {
        let deadline = StdDuration::from_secs(self.config.confirm_deadline_seconds);
        let confirmed = timeout(deadline, self.confirm_tx(booking_id, payment_id, gateway))
            .await
            .map_err(|_| ApiError::Internal("booking confirm deadline exceeded".to_string()))??;

        let (booking, seats) = match confirmed {
            ConfirmedTx::Already(booking) => {
                return Ok(ConfirmOutcome::AlreadyConfirmed(booking))
            }
            ConfirmedTx::Fresh { booking, seats } => (booking, seats),
        };

        // Вне транзакции: KV-ключи блокировок больше не нужны, счётчики
        // не меняются (место прошло locked -> booked, доступность та же).
        let cache = self.cache.clone();
        let event_id = booking.event_id;
        let kv_seats: Vec<(i64, String)> = seats
            .iter()
            .map(|s| (s.seat_type_id, s.seat_label.clone()))
            .collect();
        tokio::spawn(async move {
            for (seat_type_id, label) in kv_seats {
                let _ = cache.drop_seat_lock(event_id, seat_type_id, &label).await;
            }
            cache.invalidate_event(event_id).await;
        });

        // Генерация билетов уходит в очередь; если очередь недоступна,
        // считаем билеты синхронно и возвращаем их сразу.
        let ticket_seats: Vec<TicketSeat> = seats
            .iter()
            .map(|s| TicketSeat {
                seat_id: s.seat_id,
                seat_label: s.seat_label.clone(),
                seat_type_name: s.seat_type_name.clone(),
                price_paid: s.price_paid,
            })
            .collect();

        let tickets = match self.tickets.enqueue_generation(&booking, &ticket_seats).await {
            Ok(job_id) => {
                info!(
                    "Booking {} confirmed, ticket job {} enqueued",
                    booking.reference, job_id
                );
                None
            }
            Err(e) => {
                warn!(
                    "ticket queue unavailable for booking {}: {}; generating inline",
                    booking.reference, e
                );
                match self.tickets.generate_inline(&booking, &ticket_seats).await {
                    Ok(tickets) => Some(tickets),
                    Err(gen_err) => {
                        // Подтверждение уже зафиксировано; билеты догенерирует
                        // ретрай вебхука или ручной запрос статуса.
                        error!(
                            "inline ticket generation failed for booking {}: {}",
                            booking.reference, gen_err
                        );
                        None
                    }
                }
            }
        };

        self.bus.publish(LiveEvent::BookingConfirmed {
            booking_id: booking.id,
            event_id: booking.event_id,
        });

        Ok(ConfirmOutcome::Confirmed { booking, tickets })
    }

    async fn confirm_tx(
        &self,
        booking_id: i64,
        payment_id: &str,
        gateway: &str,
    ) -> Result<ConfirmedTx> {
        let now = Utc::now();
        let mut tx = self.db.pool.begin().await?;

        let booking = sqlx::query_as::<_, Booking>(
            "SELECT id, reference, event_id, user_id, total_amount, status,
                    payment_status, payment_id, payment_gateway, booked_at,
                    confirmed_at, cancelled_at, cancellation_reason, expires_at
             FROM bookings WHERE id = $1
             FOR UPDATE",
        )
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::NotFound("Booking not found".to_string()))?;

        // Повторная доставка того же платежа: отдаём как есть.
        if booking.is_confirmed_with(payment_id) {
            tx.rollback().await.ok();
            return Ok(ConfirmedTx::Already(booking));
        }

        if booking.status != booking_status::PENDING {
            return Err(ApiError::Conflict(
                "Booking is not pending and cannot be confirmed".to_string(),
            ));
        }
        if booking.expires_at <= now {
            return Err(ApiError::Stale(
                "Booking has expired. Please create a new booking.".to_string(),
            ));
        }

        // Запираем каждое связанное место; все обязаны быть `locked`.
        let seats: Vec<ConfirmSeat> = sqlx::query_as(
            "SELECT s.id, s.seat_type_id, s.seat_label, s.status, st.name, bs.price_paid
             FROM booking_seats bs
             JOIN seats s ON s.id = bs.seat_id
             JOIN event_seat_types st ON st.id = s.seat_type_id
             WHERE bs.booking_id = $1
             ORDER BY s.id
             FOR UPDATE OF s",
        )
        .bind(booking_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(
            |(seat_id, seat_type_id, seat_label, status, seat_type_name, price_paid): (
                i64,
                i64,
                String,
                String,
                String,
                Decimal,
            )| ConfirmSeat {
                seat_id,
                seat_type_id,
                seat_label,
                status,
                seat_type_name,
                price_paid,
            },
        )
        .collect();

        if seats.is_empty() {
            return Err(ApiError::Conflict(
                "Booking has no seats attached".to_string(),
            ));
        }
        if let Some(bad) = seats
            .iter()
            .find(|s| s.status != crate::models::seat::seat_status::LOCKED)
        {
            return Err(ApiError::Stale(format!(
                "Seat {} is no longer locked",
                bad.seat_label
            )));
        }

        // Оптимистичный гард от двойного подтверждения.
        let updated = sqlx::query(
            "UPDATE bookings
             SET status = 'confirmed', payment_status = 'completed',
                 payment_id = $2, payment_gateway = $3, confirmed_at = $4
             WHERE id = $1 AND status = 'pending' AND payment_status = 'pending'",
        )
        .bind(booking_id)
        .bind(payment_id)
        .bind(gateway)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(ApiError::Conflict(
                "Booking was confirmed concurrently".to_string(),
            ));
        }

        for seat in &seats {
            let moved = sqlx::query(
                "UPDATE seats SET status = 'booked', booked_at = $2
                 WHERE id = $1 AND status = 'locked'",
            )
            .bind(seat.seat_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if moved != 1 {
                return Err(ApiError::Conflict(format!(
                    "Seat {} changed state during confirmation",
                    seat.seat_label
                )));
            }
        }

        tx.commit().await?;

        let confirmed = Booking {
            status: booking_status::CONFIRMED.to_string(),
            payment_status: payment_status::COMPLETED.to_string(),
            payment_id: Some(payment_id.to_string()),
            payment_gateway: Some(gateway.to_string()),
            confirmed_at: Some(now),
            ..booking
        };

        Ok(ConfirmedTx::Fresh {
            booking: confirmed,
            seats,
        })
    }

    // --- Отмена ---

    /// Отменяет `pending`-бронирование пользователя и возвращает места.
    ///
    /// С ключом идемпотентности ретраи получают байт-в-байт тот же ответ;
    /// повторная отмена уже отменённого бронирования - успех.
    pub async fn cancel_booking(
        &self,
        booking_id: i64,
        user_id: i64,
        reason: Option<String>,
        idempotency_key: Option<String>,
        origin: Option<ConnectionId>,
    ) -> Result<Value> {
        if let Some(ref key) = idempotency_key {
            match self
                .idempotency
                .begin(key, "cancel_booking", Some(booking_id), user_id)
                .await?
            {
                IdempotencyClaim::Completed(snapshot) => return Ok(snapshot),
                IdempotencyClaim::InFlight => return Err(ApiError::InFlight),
                IdempotencyClaim::Started => {}
            }
        }

        let result = self
            .cancel_booking_inner(booking_id, user_id, reason, origin)
            .await;

        if let Some(ref key) = idempotency_key {
            match &result {
                Ok(response) => self.idempotency.complete(key, response).await,
                Err(_) => self.idempotency.fail(key).await,
            }
        }

        result
    }

    async fn cancel_booking_inner(
        &self,
        booking_id: i64,
        user_id: i64,
        reason: Option<String>,
        origin: Option<ConnectionId>,
    ) -> Result<Value> {
        let now = Utc::now();
        let mut tx = self.db.pool.begin().await?;

        // SKIP LOCKED: если бронирование держит другой запрос (встречная
        // отмена или подтверждение), не ждём его - отвечаем IN_FLIGHT.
        let booking = sqlx::query_as::<_, Booking>(
            "SELECT id, reference, event_id, user_id, total_amount, status,
                    payment_status, payment_id, payment_gateway, booked_at,
                    confirmed_at, cancelled_at, cancellation_reason, expires_at
             FROM bookings WHERE id = $1 AND user_id = $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(booking_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let booking = match booking {
            Some(b) => b,
            None => {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM bookings WHERE id = $1 AND user_id = $2)",
                )
                .bind(booking_id)
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;
                tx.rollback().await.ok();
                return if exists {
                    Err(ApiError::InFlight)
                } else {
                    Err(ApiError::NotFound("Booking not found".to_string()))
                };
            }
        };

        // Оплаченное бронирование отменяется только через возврат средств.
        if booking.status == booking_status::CONFIRMED
            && booking.payment_status == payment_status::COMPLETED
        {
            return Err(ApiError::Conflict(
                "Confirmed booking cannot be cancelled; request a refund instead".to_string(),
            ));
        }

        // Терминально-идемпотентно: уже отменено - это успех.
        if booking.status == booking_status::CANCELLED {
            tx.rollback().await.ok();
            return Ok(cancel_response(&booking, 0));
        }

        let released = self.release_booking_seats(&mut tx, booking_id).await?;

        sqlx::query(
            "UPDATE bookings
             SET status = 'cancelled', payment_status = 'refunded',
                 cancelled_at = $2, cancellation_reason = $3
             WHERE id = $1",
        )
        .bind(booking_id)
        .bind(now)
        .bind(reason.as_deref().unwrap_or("cancelled by user"))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.after_seats_released(booking.event_id, &released).await;

        self.bus.publish_from(
            origin,
            LiveEvent::BookingCancelled {
                booking_id,
                event_id: booking.event_id,
            },
        );

        info!(
            "Booking {} cancelled, {} seats released",
            booking.reference,
            released.len()
        );

        Ok(cancel_response(&booking, released.len()))
    }

    /// Отмена по таймауту окна оплаты (вызывается свипером).
    pub async fn expire_booking(&self, booking_id: i64) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.db.pool.begin().await?;

        let booking = sqlx::query_as::<_, Booking>(
            "SELECT id, reference, event_id, user_id, total_amount, status,
                    payment_status, payment_id, payment_gateway, booked_at,
                    confirmed_at, cancelled_at, cancellation_reason, expires_at
             FROM bookings
             WHERE id = $1 AND status = 'pending' AND expires_at <= $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(booking_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let booking = match booking {
            Some(b) => b,
            None => {
                tx.rollback().await.ok();
                return Ok(false);
            }
        };

        let released = self.release_booking_seats(&mut tx, booking_id).await?;

        sqlx::query(
            "UPDATE bookings
             SET status = 'cancelled', cancelled_at = $2,
                 cancellation_reason = 'payment window expired'
             WHERE id = $1",
        )
        .bind(booking_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.after_seats_released(booking.event_id, &released).await;

        self.bus.publish(LiveEvent::BookingCancelled {
            booking_id,
            event_id: booking.event_id,
        });

        Ok(true)
    }

    /// Удаляет ещё не выкупленные места бронирования и возвращает
    /// доступность по категориям (с клампом по quantity).
    async fn release_booking_seats(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        booking_id: i64,
    ) -> Result<Vec<(i64, String)>> {
        let released: Vec<(i64, String)> = sqlx::query_as(
            "DELETE FROM seats s
             USING booking_seats bs
             WHERE bs.booking_id = $1 AND bs.seat_id = s.id AND s.status = 'locked'
             RETURNING s.seat_type_id, s.seat_label",
        )
        .bind(booking_id)
        .fetch_all(&mut **tx)
        .await?;

        for (seat_type_id, count) in group_counts(released.iter().map(|(t, _)| *t)) {
            sqlx::query(
                "UPDATE event_seat_types
                 SET available_quantity = LEAST(quantity, available_quantity + $2)
                 WHERE id = $1",
            )
            .bind(seat_type_id)
            .bind(count)
            .execute(&mut **tx)
            .await?;
        }

        Ok(released)
    }

    /// Пост-транзакционная уборка: KV-ключи, счётчики, кеши.
    async fn after_seats_released(&self, event_id: i64, released: &[(i64, String)]) {
        if released.is_empty() {
            return;
        }
        let cache = self.cache.clone();
        let released = released.to_vec();
        tokio::spawn(async move {
            for (seat_type_id, count) in group_counts(released.iter().map(|(t, _)| *t)) {
                cache
                    .increment_availability(event_id, seat_type_id, count)
                    .await;
            }
            for (seat_type_id, label) in &released {
                let _ = cache.drop_seat_lock(event_id, *seat_type_id, label).await;
            }
            cache.invalidate_event(event_id).await;
        });
    }

    // --- Чтение для контроллеров ---

    pub async fn get_booking(&self, booking_id: i64) -> Result<Booking> {
        sqlx::query_as::<_, Booking>(
            "SELECT id, reference, event_id, user_id, total_amount, status,
                    payment_status, payment_id, payment_gateway, booked_at,
                    confirmed_at, cancelled_at, cancellation_reason, expires_at
             FROM bookings WHERE id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.db.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("Booking not found".to_string()))
    }

    pub async fn get_booking_seats(&self, booking_id: i64) -> Result<Vec<BookingSeatRow>> {
        let rows = sqlx::query_as::<_, BookingSeatRow>(
            "SELECT bs.booking_id, bs.seat_id, s.seat_label, s.seat_type_id, bs.price_paid
             FROM booking_seats bs
             JOIN seats s ON s.id = bs.seat_id
             WHERE bs.booking_id = $1
             ORDER BY s.seat_type_id, s.seat_label",
        )
        .bind(booking_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_user_bookings(
        &self,
        user_id: i64,
        status: Option<String>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>> {
        let limit = limit.clamp(1, 100);
        let offset = offset.max(0);

        let bookings = match status {
            Some(status) => {
                sqlx::query_as::<_, Booking>(
                    "SELECT id, reference, event_id, user_id, total_amount, status,
                            payment_status, payment_id, payment_gateway, booked_at,
                            confirmed_at, cancelled_at, cancellation_reason, expires_at
                     FROM bookings
                     WHERE user_id = $1 AND status = $2
                     ORDER BY booked_at DESC
                     LIMIT $3 OFFSET $4",
                )
                .bind(user_id)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Booking>(
                    "SELECT id, reference, event_id, user_id, total_amount, status,
                            payment_status, payment_id, payment_gateway, booked_at,
                            confirmed_at, cancelled_at, cancellation_reason, expires_at
                     FROM bookings
                     WHERE user_id = $1
                     ORDER BY booked_at DESC
                     LIMIT $2 OFFSET $3",
                )
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db.pool)
                .await?
            }
        };
        Ok(bookings)
    }
}

#[derive(Debug)]
struct ConfirmSeat {
    seat_id: i64,
    seat_type_id: i64,
    seat_label: String,
    status: String,
    seat_type_name: String,
    price_paid: Decimal,
}

enum ConfirmedTx {
    Fresh {
        booking: Booking,
        seats: Vec<ConfirmSeat>,
    },
    Already(Booking),
}

fn cancel_response(booking: &Booking, seats_released: usize) -> Value {
    json!({
        "booking_id": booking.id,
        "reference": booking.reference,
        "status": "cancelled",
        "seats_released": seats_released,
    })
}

fn group_counts(ids: impl Iterator<Item = i64>) -> HashMap<i64, i64> {
    let mut counts = HashMap::new();
    for id in ids {
        *counts.entry(id).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn reference_has_documented_shape() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        assert_eq!(booking_reference(at, 0xA3F2), "BKG-2026-0801-143000-A3F2");
    }

    #[test]
    fn group_counts_sums_per_type() {
        let counts = group_counts(vec![2, 2, 3, 2].into_iter());
        assert_eq!(counts.get(&2), Some(&3));
        assert_eq!(counts.get(&3), Some(&1));
    }

    proptest! {
        // Формат `BKG-YYYY-MMDD-HHMMSS-XXXX` для любых момента и суффикса.
        #[test]
        fn reference_format_holds(secs in 0i64..4_102_444_800, suffix in 0u16..=u16::MAX) {
            let at = Utc.timestamp_opt(secs, 0).unwrap();
            let reference = booking_reference(at, suffix);
            let parts: Vec<&str> = reference.split('-').collect();
            prop_assert_eq!(parts.len(), 5);
            prop_assert_eq!(parts[0], "BKG");
            prop_assert_eq!(parts[1].len(), 4);
            prop_assert_eq!(parts[2].len(), 4);
            prop_assert_eq!(parts[3].len(), 6);
            prop_assert_eq!(parts[4].len(), 4);
            prop_assert!(parts[4].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        }
    }
}
