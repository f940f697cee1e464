//! sweeper.rs
//!
//! Свипер: возвращает систему к консистентности, когда держатели
//! блокировок ушли не попрощавшись.
//!
//! Два расписания: каждые 5 минут - просроченные бронирования и
//! блокировки мест с восстановлением доступности; раз в час - протухшие
//! токены, ключи идемпотентности и ретенция очереди джобов. Оба свипа
//! детерминированы и безопасны при конкурентном запуске в нескольких
//! репликах: всю работу делают условные DELETE/UPDATE.

use chrono::Utc;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    cache::CacheService,
    database::Database,
    realtime::{messages::LiveEvent, EventBus},
    redis_client::RedisClient,
    services::{bookings::BookingCoordinator, tickets::TicketService},
};

/// Минимальный интервал между запусками одного вида свипа.
const MIN_RUN_INTERVAL: Duration = Duration::from_secs(30);

pub struct ExpirySweeper {
    db: Database,
    redis: RedisClient,
    cache: CacheService,
    bus: EventBus,
    coordinator: BookingCoordinator,
    tickets: TicketService,
    // Страховка от наложения запусков: конкурентность свипа всегда 1.
    lock_sweep_gate: Mutex<Option<Instant>>,
    token_sweep_gate: Mutex<Option<Instant>>,
}

impl ExpirySweeper {
    pub fn new(
        db: Database,
        redis: RedisClient,
        cache: CacheService,
        bus: EventBus,
        coordinator: BookingCoordinator,
        tickets: TicketService,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            redis,
            cache,
            bus,
            coordinator,
            tickets,
            lock_sweep_gate: Mutex::new(None),
            token_sweep_gate: Mutex::new(None),
        })
    }

    // --- Пятиминутный свип ---

    /// Просроченные бронирования и блокировки мест.
    pub async fn run_lock_sweep(&self) {
        let Ok(mut last_run) = self.lock_sweep_gate.try_lock() else {
            warn!("🧹 Lock sweep already running, skipping");
            return;
        };
        if matches!(*last_run, Some(at) if at.elapsed() < MIN_RUN_INTERVAL) {
            return;
        }
        *last_run = Some(Instant::now());

        info!("🧹 Starting lock sweep");
        self.expire_overdue_bookings().await;
        self.sweep_expired_seat_locks().await;
        self.sweep_orphaned_kv_locks().await;
        info!("✅ Lock sweep completed");
    }

    /// Pending-бронирования с истёкшим окном оплаты отменяются штатным
    /// путём координатора (места и доступность возвращает он).
    async fn expire_overdue_bookings(&self) {
        let overdue: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM bookings
             WHERE status = 'pending' AND expires_at <= NOW()
             ORDER BY expires_at
             LIMIT 200",
        )
        .fetch_all(&self.db.pool)
        .await
        .unwrap_or_default();

        if overdue.is_empty() {
            info!("🎫 No overdue pending bookings");
            return;
        }

        info!("🎫 Found {} overdue pending bookings", overdue.len());
        for booking_id in overdue {
            match self.coordinator.expire_booking(booking_id).await {
                Ok(true) => info!("🎫 Booking {} expired and released", booking_id),
                Ok(false) => {} // уже обработано конкурентом
                Err(e) => error!("🎫 Failed to expire booking {}: {}", booking_id, e),
            }
        }
    }

    /// Удаляет просроченные `locked`-строки и возвращает доступность.
    ///
    /// Места, привязанные к живому бронированию, не трогаем: их судьбу
    /// решает окно оплаты самого бронирования (инвариант связки
    /// место-бронирование сильнее TTL блокировки).
    async fn sweep_expired_seat_locks(&self) {
        let mut tx = match self.db.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("Failed to start transaction for lock sweep: {}", e);
                return;
            }
        };

        let expired: Vec<(i64, i64, String)> = sqlx::query_as(
            "DELETE FROM seats s
             WHERE s.status = 'locked' AND s.expires_at <= NOW()
               AND s.owner_user_id IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM booking_seats bs
                   JOIN bookings b ON b.id = bs.booking_id
                   WHERE bs.seat_id = s.id AND b.status <> 'cancelled'
               )
             RETURNING s.event_id, s.seat_type_id, s.seat_label",
        )
        .fetch_all(&mut *tx)
        .await
        .unwrap_or_default();

        if expired.is_empty() {
            let _ = tx.rollback().await;
            info!("🧹 No expired seat locks");
            return;
        }

        // Группируем по категории и восстанавливаем доступность с клампом.
        let mut per_type: HashMap<i64, (i64, i64)> = HashMap::new();
        for (event_id, seat_type_id, _) in &expired {
            let entry = per_type.entry(*seat_type_id).or_insert((*event_id, 0));
            entry.1 += 1;
        }

        let mut restored: Vec<(i64, i64, i64)> = Vec::with_capacity(per_type.len());
        for (seat_type_id, (event_id, count)) in &per_type {
            let available: Result<i32, _> = sqlx::query_scalar(
                "UPDATE event_seat_types
                 SET available_quantity = LEAST(quantity, available_quantity + $2)
                 WHERE id = $1
                 RETURNING available_quantity",
            )
            .bind(seat_type_id)
            .bind(count)
            .fetch_one(&mut *tx)
            .await;

            match available {
                Ok(avail) => restored.push((*event_id, *seat_type_id, avail as i64)),
                Err(e) => {
                    error!("Failed to restore availability for type {}: {}", seat_type_id, e);
                    let _ = tx.rollback().await;
                    return;
                }
            }
        }

        if let Err(e) = tx.commit().await {
            error!("Failed to commit lock sweep transaction: {}", e);
            return;
        }

        info!("🧹 Swept {} expired seat locks", expired.len());

        // Ключи KV обычно уже умерли по TTL; подчищаем оппортунистически.
        for (event_id, seat_type_id, label) in &expired {
            let _ = self.cache.drop_seat_lock(*event_id, *seat_type_id, label).await;
        }

        let mut touched_events: Vec<i64> = Vec::new();
        for (event_id, seat_type_id, available) in restored {
            self.cache.invalidate_availability(event_id, seat_type_id).await;
            if !touched_events.contains(&event_id) {
                touched_events.push(event_id);
            }
            self.bus.publish(LiveEvent::SeatTypeUpdated {
                event_id,
                seat_type_id,
                available_quantity: available,
            });
        }
        for event_id in touched_events {
            self.cache.invalidate_event(event_id).await;
        }
    }

    /// KV-ключи блокировок без строки в БД (быть их не должно - TTL
    /// обычно справляется сам).
    async fn sweep_orphaned_kv_locks(&self) {
        let keys = match self.cache.scan_seat_lock_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("🔑 Failed to scan KV lock keys: {}", e);
                return;
            }
        };

        if keys.is_empty() {
            return;
        }

        let mut orphaned: Vec<String> = Vec::new();
        for key in keys {
            let Some((event_id, seat_type_id, label)) = parse_lock_key(&key) else {
                continue;
            };

            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(
                     SELECT 1 FROM seats
                     WHERE event_id = $1 AND seat_type_id = $2 AND seat_label = $3
                 )",
            )
            .bind(event_id)
            .bind(seat_type_id)
            .bind(&label)
            .fetch_one(&self.db.pool)
            .await
            .unwrap_or(true);

            if !exists {
                orphaned.push(key);
            }
        }

        if orphaned.is_empty() {
            return;
        }

        info!("🔑 Removing {} orphaned KV lock keys", orphaned.len());
        let mut conn = self.redis.conn.clone();
        let _: Result<i64, _> = conn.del(orphaned).await;
    }

    // --- Часовой свип ---

    /// Протухшие токены, ключи идемпотентности, ретенция очереди.
    pub async fn run_token_sweep(&self) {
        let Ok(mut last_run) = self.token_sweep_gate.try_lock() else {
            warn!("🔑 Token sweep already running, skipping");
            return;
        };
        if matches!(*last_run, Some(at) if at.elapsed() < MIN_RUN_INTERVAL) {
            return;
        }
        *last_run = Some(Instant::now());

        info!("🔑 Starting token sweep");

        let now = Utc::now();
        for (table, label) in [
            ("blacklisted_tokens", "blacklisted tokens"),
            ("refresh_tokens", "refresh tokens"),
            ("idempotency_keys", "idempotency keys"),
        ] {
            let query = format!("DELETE FROM {} WHERE expires_at < $1", table);
            match sqlx::query(&query).bind(now).execute(&self.db.pool).await {
                Ok(done) => {
                    if done.rows_affected() > 0 {
                        info!("🔑 Removed {} expired {}", done.rows_affected(), label);
                    }
                }
                Err(e) => error!("Failed to sweep {}: {}", table, e),
            }
        }

        self.sweep_untracked_token_keys().await;

        match self.tickets.prune_completed_jobs().await {
            Ok(0) => {}
            Ok(n) => info!("🎫 Pruned {} completed ticket jobs", n),
            Err(e) => error!("Failed to prune ticket jobs: {}", e),
        }

        info!("✅ Token sweep completed");
    }

    /// Ключи токенов, у которых Redis потерял TTL (быть не должно).
    async fn sweep_untracked_token_keys(&self) {
        let mut conn = self.redis.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let scanned: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("blacklist:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;

            let (next, batch) = match scanned {
                Ok(v) => v,
                Err(e) => {
                    warn!("🔑 KV scan failed during token sweep: {}", e);
                    return;
                }
            };

            for key in batch {
                let ttl: i64 = redis::cmd("TTL")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .unwrap_or(0);
                // -1: ключ без TTL; такие не должны существовать вовсе.
                if ttl == -1 {
                    let _: Result<i64, _> = conn.del(&key).await;
                    removed += 1;
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if removed > 0 {
            warn!("🔑 Removed {} blacklist keys with missing TTL", removed);
        }
    }
}

/// Разбирает `seat_lock:{event}:{type}:{label}`.
fn parse_lock_key(key: &str) -> Option<(i64, i64, String)> {
    let rest = key.strip_prefix("seat_lock:")?;
    let mut parts = rest.splitn(3, ':');
    let event_id = parts.next()?.parse().ok()?;
    let seat_type_id = parts.next()?.parse().ok()?;
    let label = parts.next()?.to_string();
    Some((event_id, seat_type_id, label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_parses_back() {
        assert_eq!(
            parse_lock_key("seat_lock:12:3:V1"),
            Some((12, 3, "V1".to_string()))
        );
        assert_eq!(parse_lock_key("seat_lock:12:3"), None);
        assert_eq!(parse_lock_key("avail:12:3"), None);
        assert_eq!(parse_lock_key("seat_lock:x:3:V1"), None);
    }
}
