use crate::{database::Database, redis_client::RedisClient};
use tracing::info;

pub mod availability;
pub mod events;
pub mod seat_locks;
pub mod tokens;

/// Сервис поверх Redis и Postgres: горячие ключи в KV, чтение сквозь кеш.
///
/// Разбит по файлам: счётчики доступности, кеш событий, примитивы
/// блокировок мест и шлюз токенов - всё это impl-блоки одного сервиса.
#[derive(Clone)]
pub struct CacheService {
    redis: RedisClient,
    db: Database,
}

impl CacheService {
    pub fn new(redis: RedisClient, db: Database) -> Self {
        Self { redis, db }
    }

    // Прогрев кеша при старте
    pub async fn warmup_cache(&self) {
        info!("Starting cache warmup...");

        let events = self.list_published_events().await;
        info!("Loaded {} published events", events.len());

        for event in &events {
            let _ = self.get_event(event.id).await;
        }

        info!("Cache warmup done");
    }
}
