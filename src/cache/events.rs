use crate::cache::CacheService;
use crate::models::{Event, SeatType};
use redis::AsyncCommands;
use tracing::info;

const EVENT_TTL_SECONDS: u64 = 300;
const EVENTS_LIST_TTL_SECONDS: u64 = 3600;

impl CacheService {
    // Получить событие по id (кеш `event:{id}`, на промахе - БД)
    pub async fn get_event(&self, event_id: i64) -> Option<Event> {
        let key = format!("event:{}", event_id);
        let mut conn = self.redis.conn.clone();

        if let Ok(Some(raw)) = conn.get::<_, Option<String>>(&key).await {
            if let Ok(event) = serde_json::from_str::<Event>(&raw) {
                return Some(event);
            }
        }

        let event = sqlx::query_as::<_, Event>(
            "SELECT id, title, status, start_date, organizer_id FROM events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.db.pool)
        .await
        .ok()
        .flatten()?;

        if let Ok(raw) = serde_json::to_string(&event) {
            let _: Result<(), _> = conn.set_ex(&key, raw, EVENT_TTL_SECONDS).await;
        }
        Some(event)
    }

    // Список опубликованных будущих событий (кешируется только дефолтная страница)
    pub async fn list_published_events(&self) -> Vec<Event> {
        let mut conn = self.redis.conn.clone();

        if let Ok(Some(raw)) = conn.get::<_, Option<String>>("events:list").await {
            if let Ok(events) = serde_json::from_str::<Vec<Event>>(&raw) {
                return events;
            }
        }

        let events = sqlx::query_as::<_, Event>(
            "SELECT id, title, status, start_date, organizer_id
             FROM events
             WHERE status = 'published' AND start_date > NOW()
             ORDER BY start_date
             LIMIT 20",
        )
        .fetch_all(&self.db.pool)
        .await
        .unwrap_or_default();

        if let Ok(raw) = serde_json::to_string(&events) {
            let _: Result<(), _> = conn
                .set_ex("events:list", raw, EVENTS_LIST_TTL_SECONDS)
                .await;
        }
        events
    }

    /// Категории мест события читаются из БД без кеша: их доступность
    /// живёт в отдельных счётчиках `avail:{event}:{type}`.
    pub async fn get_seat_type(&self, event_id: i64, seat_type_id: i64) -> Option<SeatType> {
        sqlx::query_as::<_, SeatType>(
            "SELECT id, event_id, name, price, quantity, available_quantity
             FROM event_seat_types
             WHERE id = $1 AND event_id = $2",
        )
        .bind(seat_type_id)
        .bind(event_id)
        .fetch_optional(&self.db.pool)
        .await
        .ok()
        .flatten()
    }

    // Инвалидировать кеши события после любой мутации
    pub async fn invalidate_event(&self, event_id: i64) {
        let mut conn = self.redis.conn.clone();
        let key = format!("event:{}", event_id);
        let _: Result<i64, _> = conn.del(&key).await;
        let _: Result<i64, _> = conn.del("events:list").await;
        info!("Invalidated event cache for event {}", event_id);
    }
}
