//! availability.rs
//!
//! Счётчик доступности `avail:{event}:{type}` - проекция колонки
//! `event_seat_types.available_quantity` с TTL 60 секунд.
//!
//! Чтение идёт из KV, на промахе значение выводится из БД заново.
//! Инкременты/декременты атомарны и применяются только к живому ключу:
//! создавать счётчик мимо БД нельзя, иначе проекция разойдётся с
//! авторитетным значением дальше, чем на число операций в полёте.

use crate::cache::CacheService;
use redis::AsyncCommands;

const AVAIL_TTL_SECONDS: u64 = 60;

// Корректировка существующего ключа; отсутствующий ключ не создаём.
// Клامп снизу: уход ниже нуля означает устаревший счётчик, форсируем refill.
const ADJUST_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if v < 0 then
  redis.call('DEL', KEYS[1])
  return -1
end
return v
"#;

pub fn avail_key(event_id: i64, seat_type_id: i64) -> String {
    format!("avail:{}:{}", event_id, seat_type_id)
}

impl CacheService {
    /// Доступность категории: из кеша, на промахе - из БД с наполнением.
    pub async fn get_availability(
        &self,
        event_id: i64,
        seat_type_id: i64,
    ) -> Result<i64, sqlx::Error> {
        let key = avail_key(event_id, seat_type_id);

        let mut conn = self.redis.conn.clone();
        let cached: Result<Option<i64>, _> = conn.get(&key).await;
        if let Ok(Some(value)) = cached {
            return Ok(value);
        }

        // Промах или недоступный Redis - читаем авторитетное значение.
        let value: i32 = sqlx::query_scalar(
            "SELECT available_quantity FROM event_seat_types WHERE id = $1 AND event_id = $2",
        )
        .bind(seat_type_id)
        .bind(event_id)
        .fetch_one(&self.db.pool)
        .await?;

        let _: Result<(), _> = conn.set_ex(&key, value as i64, AVAIL_TTL_SECONDS).await;
        Ok(value as i64)
    }

    pub async fn decrement_availability(&self, event_id: i64, seat_type_id: i64) {
        self.adjust_availability(event_id, seat_type_id, -1).await;
    }

    pub async fn increment_availability(&self, event_id: i64, seat_type_id: i64, by: i64) {
        self.adjust_availability(event_id, seat_type_id, by).await;
    }

    // Ошибки кеша подавляются: счётчик - проекция, БД остаётся источником истины.
    async fn adjust_availability(&self, event_id: i64, seat_type_id: i64, delta: i64) {
        let key = avail_key(event_id, seat_type_id);
        let mut conn = self.redis.conn.clone();
        let result: Result<i64, _> = redis::cmd("EVAL")
            .arg(ADJUST_SCRIPT)
            .arg(1)
            .arg(&key)
            .arg(delta)
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            tracing::warn!(
                "availability counter adjust failed for {}: {} (will refill from DB)",
                key,
                e
            );
        }
    }

    /// Инвалидация счётчика одной категории.
    pub async fn invalidate_availability(&self, event_id: i64, seat_type_id: i64) {
        let key = avail_key(event_id, seat_type_id);
        let mut conn = self.redis.conn.clone();
        let _: Result<i64, _> = conn.del(&key).await;
    }

    /// Инвалидация всех счётчиков события (курсорный SCAN, без KEYS).
    pub async fn invalidate_event_availability(&self, event_id: i64) {
        let mut conn = self.redis.conn.clone();
        let pattern = format!("avail:{}:*", event_id);
        let mut cursor: u64 = 0;

        loop {
            let scanned: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;

            let (next, batch) = match scanned {
                Ok(v) => v,
                Err(_) => return,
            };

            if !batch.is_empty() {
                let _: Result<i64, _> = conn.del(batch).await;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_matches_keyspace() {
        assert_eq!(avail_key(7, 2), "avail:7:2");
    }
}
