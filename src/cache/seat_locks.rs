//! seat_locks.rs
//!
//! KV-примитивы мягких блокировок мест.
//!
//! Ключ `seat_lock:{event}:{type}:{label}` создаётся строго условно
//! (SET NX EX): из двух конкурирующих запросов выигрывает ровно один,
//! проигравший даже не дойдёт до вставки в БД. TTL ключа авторитетен
//! для быстрой проверки занятости; за консистентность строк в БД
//! отвечает свипер.

use crate::cache::CacheService;
use crate::models::SeatLock;
use redis::AsyncCommands;

pub fn seat_lock_key(event_id: i64, seat_type_id: i64, seat_label: &str) -> String {
    format!("seat_lock:{}:{}:{}", event_id, seat_type_id, seat_label)
}

impl CacheService {
    /// Атомарно ставит блокировку, если её ещё нет.
    ///
    /// Возвращает `true`, если ключ создан этим вызовом; `false`, если
    /// место уже держит кто-то другой (быстрый отказ без похода в БД).
    pub async fn try_acquire_seat_lock(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
        lock: &SeatLock,
        ttl_seconds: i64,
    ) -> Result<bool, redis::RedisError> {
        let key = seat_lock_key(event_id, seat_type_id, seat_label);
        let value = serde_json::to_string(lock).map_err(|_| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "Serialize error"))
        })?;
        let mut conn = self.redis.conn.clone();

        // SET NX EX - атомарная операция без гонок
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    pub async fn get_seat_lock(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
    ) -> Result<Option<SeatLock>, redis::RedisError> {
        let key = seat_lock_key(event_id, seat_type_id, seat_label);
        let mut conn = self.redis.conn.clone();
        let raw: Option<String> = conn.get(&key).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Пакетное чтение блокировок одним пайплайном (для карты зала).
    pub async fn get_seat_locks(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_labels: &[String],
    ) -> Result<Vec<Option<SeatLock>>, redis::RedisError> {
        if seat_labels.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.redis.conn.clone();
        let mut pipe = redis::pipe();
        for label in seat_labels {
            pipe.get(seat_lock_key(event_id, seat_type_id, label));
        }

        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(raw
            .into_iter()
            .map(|v| v.and_then(|s| serde_json::from_str(&s).ok()))
            .collect())
    }

    /// Удаляет блокировку, только если её держит указанный пользователь.
    ///
    /// Чтение и удаление не атомарны между собой, но финальный арбитр
    /// владения - уникальный констрейнт в БД; здесь достаточно защиты
    /// от случайного снятия чужого ключа.
    pub async fn release_seat_lock_guarded(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
        user_id: i64,
    ) -> Result<bool, redis::RedisError> {
        let key = seat_lock_key(event_id, seat_type_id, seat_label);
        let mut conn = self.redis.conn.clone();

        let raw: Option<String> = conn.get(&key).await?;
        let holder = raw
            .and_then(|s| serde_json::from_str::<SeatLock>(&s).ok())
            .map(|l| l.user_id);

        if holder != Some(user_id) {
            return Ok(false);
        }

        let removed: i64 = conn.del(&key).await?;
        Ok(removed > 0)
    }

    /// Безусловное удаление ключа блокировки (компенсации и свип).
    pub async fn drop_seat_lock(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
    ) -> Result<(), redis::RedisError> {
        let key = seat_lock_key(event_id, seat_type_id, seat_label);
        let mut conn = self.redis.conn.clone();
        let _: i64 = conn.del(&key).await?;
        Ok(())
    }

    /// Переписывает значение и TTL существующей блокировки (продление).
    pub async fn extend_seat_lock(
        &self,
        event_id: i64,
        seat_type_id: i64,
        seat_label: &str,
        lock: &SeatLock,
        ttl_seconds: i64,
    ) -> Result<bool, redis::RedisError> {
        let key = seat_lock_key(event_id, seat_type_id, seat_label);
        let value = serde_json::to_string(lock).map_err(|_| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "Serialize error"))
        })?;
        let mut conn = self.redis.conn.clone();

        // XX: только если ключ ещё жив; истёкшую блокировку не воскрешаем.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("XX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    /// Обходит все ключи блокировок курсорным SCAN (для свипера).
    pub async fn scan_seat_lock_keys(&self) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.redis.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("seat_lock:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_matches_keyspace() {
        assert_eq!(seat_lock_key(12, 3, "V1"), "seat_lock:12:3:V1");
    }
}
