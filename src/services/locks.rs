//! locks.rs
//!
//! Менеджер мягких блокировок мест: атомарный захват, продление и
//! освобождение при произвольной конкуренции.
//!
//! Захват идёт в два шага по двум хранилищам:
//! 1. условный SET NX EX в Redis - быстрый отказ проигравшему без похода в БД;
//! 2. транзакция в Postgres: вставка строки места под уникальным
//!    констрейнтом `(seat_type_id, seat_label)` и декремент доступности
//!    с защитой от ухода ниже нуля.
//! Констрейнт БД - финальный арбитр: если вставка не прошла, KV-ключ
//! компенсируется удалением и вызывающий получает конфликт.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use tokio::time::timeout;
use tracing::warn;

use crate::{
    cache::CacheService,
    config::BookingConfig,
    database::Database,
    error::{ApiError, Result},
    models::{seat::seat_status, Seat, SeatLock},
    realtime::{connection::ConnectionId, messages::LiveEvent, EventBus},
};

/// Нормализует и проверяет метку места: trim, верхний регистр,
/// `[A-Z0-9]{1,20}`. Любой другой ввод отклоняется до записи в хранилища.
pub fn validate_seat_label(raw: &str) -> Result<String> {
    let label = raw.trim().to_uppercase();
    if label.is_empty() || label.len() > 20 {
        return Err(ApiError::Validation(
            "Seat label must be 1-20 characters of A-Z and 0-9".to_string(),
        ));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(ApiError::Validation(
            "Seat label must be 1-20 characters of A-Z and 0-9".to_string(),
        ));
    }
    Ok(label)
}

#[derive(Clone)]
pub struct SeatLockManager {
    db: Database,
    cache: CacheService,
    bus: EventBus,
    config: BookingConfig,
}

impl SeatLockManager {
    pub fn new(db: Database, cache: CacheService, bus: EventBus, config: BookingConfig) -> Self {
        Self {
            db,
            cache,
            bus,
            config,
        }
    }

    /// Захватывает место для пользователя на LOCK_TTL.
    ///
    /// Из двух конкурентов за одну метку выигрывает тот, чей SET NX
    /// прошёл первым; проигравший не делает вставку в БД вовсе.
    pub async fn acquire(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
        user_id: i64,
        origin: Option<ConnectionId>,
    ) -> Result<SeatLock> {
        let label = validate_seat_label(seat_label)?;

        let now = Utc::now();
        let event = self
            .cache
            .get_event(event_id)
            .await
            .ok_or_else(|| ApiError::NotFound("Event not found".to_string()))?;
        if !event.is_open_for_booking(now) {
            return Err(ApiError::Conflict(
                "Event is not open for booking".to_string(),
            ));
        }
        self.cache
            .get_seat_type(event_id, seat_type_id)
            .await
            .ok_or_else(|| ApiError::NotFound("Seat type not found".to_string()))?;

        let lock = SeatLock {
            user_id,
            locked_at: now,
            expires_at: now + Duration::seconds(self.config.lock_ttl_seconds),
        };

        // Шаг 1: условная запись в KV - быстрый отказ при занятом месте.
        let acquired = self
            .cache
            .try_acquire_seat_lock(
                event_id,
                seat_type_id,
                &label,
                &lock,
                self.config.lock_ttl_seconds,
            )
            .await?;
        if !acquired {
            return Err(ApiError::Conflict(format!(
                "Seat {} is already taken. Please select another seat.",
                label
            )));
        }

        // Шаг 2: персист под дедлайном. Любой исход, кроме успеха,
        // компенсируется удалением KV-ключа.
        let deadline = StdDuration::from_secs(self.config.acquire_deadline_seconds);
        let persisted = timeout(
            deadline,
            self.persist_lock(event_id, seat_type_id, &label, user_id, &lock),
        )
        .await;

        let available_quantity = match persisted {
            Ok(Ok(avail)) => avail,
            Ok(Err(e)) => {
                self.compensate_kv(event_id, seat_type_id, &label, user_id).await;
                return Err(e);
            }
            Err(_elapsed) => {
                self.compensate_kv(event_id, seat_type_id, &label, user_id).await;
                return Err(ApiError::Internal(
                    "seat lock acquire deadline exceeded".to_string(),
                ));
            }
        };

        // Шаг 3: после коммита - счётчик и кеши асинхронно, событие в шину.
        let cache = self.cache.clone();
        tokio::spawn(async move {
            cache.decrement_availability(event_id, seat_type_id).await;
            cache.invalidate_event(event_id).await;
        });

        self.bus.publish_from(
            origin,
            LiveEvent::SeatLocked {
                event_id,
                seat_type_id,
                seat_label: label,
                user_id,
                available_quantity,
                lock: lock.clone(),
            },
        );

        Ok(lock)
    }

    /// Транзакция персиста: строка места + декремент доступности.
    async fn persist_lock(
        &self,
        event_id: i64,
        seat_type_id: i64,
        label: &str,
        user_id: i64,
        lock: &SeatLock,
    ) -> Result<i64> {
        let mut tx = self.db.pool.begin().await?;

        let seat_id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO seats (event_id, seat_type_id, seat_label, status, owner_user_id, locked_at, expires_at)
             VALUES ($1, $2, $3, 'locked', $4, $5, $6)
             ON CONFLICT (seat_type_id, seat_label) DO NOTHING
             RETURNING id",
        )
        .bind(event_id)
        .bind(seat_type_id)
        .bind(label)
        .bind(user_id)
        .bind(lock.locked_at)
        .bind(lock.expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        if seat_id.is_none() {
            // Конкурирующая транзакция успела занять слот между нашим
            // SET NX и вставкой (KV был сброшен или ключ истёк).
            return Err(ApiError::Conflict(format!(
                "Seat {} is already taken. Please select another seat.",
                label
            )));
        }

        let available: Option<i32> = sqlx::query_scalar(
            "UPDATE event_seat_types
             SET available_quantity = available_quantity - 1
             WHERE id = $1 AND available_quantity > 0
             RETURNING available_quantity",
        )
        .bind(seat_type_id)
        .fetch_optional(&mut *tx)
        .await?;

        let available = match available {
            Some(v) => v,
            None => {
                // Метка была свободна, но категория распродана: нарушение
                // инварианта доступности. Откат уберёт строку места.
                warn!(
                    "availability guard hit for seat_type {} while label {} was free",
                    seat_type_id, label
                );
                return Err(ApiError::Conflict(
                    "No availability left for this seat type".to_string(),
                ));
            }
        };

        tx.commit().await?;
        Ok(available as i64)
    }

    async fn compensate_kv(&self, event_id: i64, seat_type_id: i64, label: &str, user_id: i64) {
        if let Err(e) = self
            .cache
            .release_seat_lock_guarded(event_id, seat_type_id, label, user_id)
            .await
        {
            warn!(
                "failed to compensate KV lock for {}:{}:{}: {}",
                event_id, seat_type_id, label, e
            );
        }
    }

    /// Снимает блокировку; разрешено только держателю.
    /// Возвращает `true`, если место действительно было освобождено.
    pub async fn release(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
        user_id: i64,
        origin: Option<ConnectionId>,
    ) -> Result<bool> {
        let label = validate_seat_label(seat_label)?;

        let mut tx = self.db.pool.begin().await?;

        // Место, уже привязанное к живому бронированию, напрямую не
        // освобождается - только через отмену бронирования.
        let deleted: Option<i64> = sqlx::query_scalar(
            "DELETE FROM seats s
             WHERE s.event_id = $1 AND s.seat_type_id = $2 AND s.seat_label = $3
               AND s.owner_user_id = $4 AND s.status = 'locked'
               AND NOT EXISTS (
                   SELECT 1 FROM booking_seats bs
                   JOIN bookings b ON b.id = bs.booking_id
                   WHERE bs.seat_id = s.id AND b.status <> 'cancelled'
               )
             RETURNING s.id",
        )
        .bind(event_id)
        .bind(seat_type_id)
        .bind(&label)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if deleted.is_none() {
            tx.rollback().await.ok();
            return Ok(false);
        }

        let available: i32 = sqlx::query_scalar(
            "UPDATE event_seat_types
             SET available_quantity = LEAST(quantity, available_quantity + 1)
             WHERE id = $1
             RETURNING available_quantity",
        )
        .bind(seat_type_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Err(e) = self
            .cache
            .release_seat_lock_guarded(event_id, seat_type_id, &label, user_id)
            .await
        {
            warn!("failed to drop KV lock on release: {}", e);
        }

        let cache = self.cache.clone();
        tokio::spawn(async move {
            cache.increment_availability(event_id, seat_type_id, 1).await;
            cache.invalidate_event(event_id).await;
        });

        self.bus.publish_from(
            origin,
            LiveEvent::SeatTypeUpdated {
                event_id,
                seat_type_id,
                available_quantity: available as i64,
            },
        );

        Ok(true)
    }

    /// Продлевает блокировку держателя на `additional_seconds` от текущего
    /// момента. Новый срок считается в коде приложения абсолютной меткой
    /// времени; интервал из пользовательского ввода в SQL не попадает.
    pub async fn extend(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
        user_id: i64,
        additional_seconds: i64,
    ) -> Result<bool> {
        let label = validate_seat_label(seat_label)?;
        if !(1..=3600).contains(&additional_seconds) {
            return Err(ApiError::Validation(
                "additional_seconds must be between 1 and 3600".to_string(),
            ));
        }

        let now = Utc::now();
        let new_expires_at = now + Duration::seconds(additional_seconds);

        // Срок только растёт: GREATEST защищает от укорачивания.
        let row: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)> = sqlx::query_as(
            "UPDATE seats
             SET expires_at = GREATEST(expires_at, $1)
             WHERE event_id = $2 AND seat_type_id = $3 AND seat_label = $4
               AND owner_user_id = $5 AND status = 'locked' AND expires_at > $6
             RETURNING locked_at, expires_at",
        )
        .bind(new_expires_at)
        .bind(event_id)
        .bind(seat_type_id)
        .bind(&label)
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.db.pool)
        .await?;

        let (locked_at, expires_at) = match row {
            Some(v) => v,
            None => return Ok(false),
        };

        let lock = SeatLock {
            user_id,
            locked_at,
            expires_at,
        };
        let ttl = (expires_at - now).num_seconds().max(1);
        if let Err(e) = self
            .cache
            .extend_seat_lock(event_id, seat_type_id, &label, &lock, ttl)
            .await
        {
            warn!("failed to extend KV lock TTL: {}", e);
        }

        Ok(true)
    }

    /// Текущая блокировка метки: KV быстрый путь, БД как резерв.
    pub async fn get(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
    ) -> Result<Option<SeatLock>> {
        let label = validate_seat_label(seat_label)?;

        if let Ok(Some(lock)) = self
            .cache
            .get_seat_lock(event_id, seat_type_id, &label)
            .await
        {
            return Ok(Some(lock));
        }

        let lock = sqlx::query_as::<_, (i64, chrono::DateTime<Utc>, chrono::DateTime<Utc>)>(
            "SELECT owner_user_id, locked_at, expires_at FROM seats
             WHERE event_id = $1 AND seat_type_id = $2 AND seat_label = $3
               AND status = 'locked' AND expires_at > NOW()",
        )
        .bind(event_id)
        .bind(seat_type_id)
        .bind(&label)
        .fetch_optional(&self.db.pool)
        .await?
        .map(|(user_id, locked_at, expires_at)| SeatLock {
            user_id,
            locked_at,
            expires_at,
        });

        Ok(lock)
    }

    /// Пакетное чтение блокировок для карты зала.
    pub async fn batch_get(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_labels: &[String],
    ) -> Result<HashMap<String, Option<SeatLock>>> {
        let mut labels = Vec::with_capacity(seat_labels.len());
        for raw in seat_labels {
            labels.push(validate_seat_label(raw)?);
        }

        let cached = self
            .cache
            .get_seat_locks(event_id, seat_type_id, &labels)
            .await
            .unwrap_or_else(|_| vec![None; labels.len()]);

        let mut result: HashMap<String, Option<SeatLock>> = HashMap::with_capacity(labels.len());
        let mut misses: Vec<String> = Vec::new();
        for (label, lock) in labels.iter().zip(cached) {
            if lock.is_some() {
                result.insert(label.clone(), lock);
            } else {
                misses.push(label.clone());
            }
        }

        if !misses.is_empty() {
            let rows = sqlx::query_as::<_, (String, i64, chrono::DateTime<Utc>, chrono::DateTime<Utc>)>(
                "SELECT seat_label, owner_user_id, locked_at, expires_at FROM seats
                 WHERE event_id = $1 AND seat_type_id = $2 AND seat_label = ANY($3)
                   AND status = 'locked' AND expires_at > NOW()",
            )
            .bind(event_id)
            .bind(seat_type_id)
            .bind(&misses)
            .fetch_all(&self.db.pool)
            .await?;

            let mut found: HashMap<String, SeatLock> = rows
                .into_iter()
                .map(|(label, user_id, locked_at, expires_at)| {
                    (
                        label,
                        SeatLock {
                            user_id,
                            locked_at,
                            expires_at,
                        },
                    )
                })
                .collect();

            for label in misses {
                let lock = found.remove(&label);
                result.insert(label, lock);
            }
        }

        Ok(result)
    }

    /// Живые блокировки пользователя на событии.
    pub async fn list_by_user(&self, event_id: i64, user_id: i64) -> Result<Vec<Seat>> {
        let seats = sqlx::query_as::<_, Seat>(
            "SELECT id, event_id, seat_type_id, seat_label, status, owner_user_id,
                    locked_at, expires_at, booked_at
             FROM seats
             WHERE event_id = $1 AND owner_user_id = $2
               AND status = $3 AND expires_at > NOW()
             ORDER BY seat_type_id, seat_label",
        )
        .bind(event_id)
        .bind(user_id)
        .bind(seat_status::LOCKED)
        .fetch_all(&self.db.pool)
        .await?;

        Ok(seats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn label_is_trimmed_and_uppercased() {
        assert_eq!(validate_seat_label("  v1 ").unwrap(), "V1");
        assert_eq!(validate_seat_label("a12").unwrap(), "A12");
    }

    #[test]
    fn invalid_labels_are_rejected() {
        assert!(validate_seat_label("").is_err());
        assert!(validate_seat_label("   ").is_err());
        assert!(validate_seat_label("V-1").is_err());
        assert!(validate_seat_label("место").is_err());
        assert!(validate_seat_label("A".repeat(21).as_str()).is_err());
    }

    #[test]
    fn twenty_chars_is_the_limit() {
        assert!(validate_seat_label(&"A".repeat(20)).is_ok());
        assert!(validate_seat_label(&"A".repeat(21)).is_err());
    }

    proptest! {
        // Любой валидный результат состоит только из A-Z0-9 и длины 1..=20.
        #[test]
        fn accepted_labels_match_charset(raw in "\\PC{0,30}") {
            if let Ok(label) = validate_seat_label(&raw) {
                prop_assert!(!label.is_empty() && label.len() <= 20);
                prop_assert!(label.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
            }
        }

        #[test]
        fn canonical_labels_are_accepted_verbatim(label in "[A-Z0-9]{1,20}") {
            prop_assert_eq!(validate_seat_label(&label).unwrap(), label);
        }
    }
}
