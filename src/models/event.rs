use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Статусы события. Ядро события не создаёт, только читает.
pub mod event_status {
    pub const DRAFT: &str = "draft";
    pub const PUBLISHED: &str = "published";
    pub const CANCELLED: &str = "cancelled";
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub organizer_id: i64,
}

impl Event {
    /// Открыто ли событие для новых блокировок мест.
    pub fn is_open_for_booking(&self, now: DateTime<Utc>) -> bool {
        self.status == event_status::PUBLISHED && self.start_date > now
    }
}

/// Ценовая категория внутри события.
///
/// Места существуют виртуально: строка в `seats` появляется только на время
/// резерва, доступность считается арифметически от `quantity`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SeatType {
    pub id: i64,
    pub event_id: i64,
    pub name: String,
    pub price: Decimal,
    pub quantity: i32,
    pub available_quantity: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(status: &str, start_offset_hours: i64) -> Event {
        Event {
            id: 1,
            title: "Concert".to_string(),
            status: status.to_string(),
            start_date: Utc::now() + Duration::hours(start_offset_hours),
            organizer_id: 7,
        }
    }

    #[test]
    fn published_future_event_is_open() {
        assert!(event(event_status::PUBLISHED, 24).is_open_for_booking(Utc::now()));
    }

    #[test]
    fn draft_cancelled_or_started_events_are_closed() {
        assert!(!event(event_status::DRAFT, 24).is_open_for_booking(Utc::now()));
        assert!(!event(event_status::CANCELLED, 24).is_open_for_booking(Utc::now()));
        assert!(!event(event_status::PUBLISHED, -1).is_open_for_booking(Utc::now()));
    }
}
