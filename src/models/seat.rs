use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Статусы строки места. Строка существует только пока место занято:
/// свободное место - это отсутствие строки.
pub mod seat_status {
    pub const LOCKED: &str = "locked";
    pub const BOOKED: &str = "booked";
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Seat {
    pub id: i64,
    pub event_id: i64,
    pub seat_type_id: i64,
    pub seat_label: String,
    pub status: String,
    pub owner_user_id: i64,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub booked_at: Option<DateTime<Utc>>,
}

impl Seat {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == seat_status::LOCKED && self.expires_at <= now
    }
}

/// Значение KV-ключа `seat_lock:{event}:{type}:{label}` и ответ API блокировки.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatLock {
    pub user_id: i64,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn locked_seat_past_expiry_is_expired() {
        let now = Utc::now();
        let seat = Seat {
            id: 1,
            event_id: 1,
            seat_type_id: 2,
            seat_label: "V1".to_string(),
            status: seat_status::LOCKED.to_string(),
            owner_user_id: 10,
            locked_at: now - Duration::minutes(11),
            expires_at: now - Duration::minutes(1),
            booked_at: None,
        };
        assert!(seat.is_expired(now));
    }

    #[test]
    fn booked_seat_never_expires() {
        let now = Utc::now();
        let seat = Seat {
            id: 1,
            event_id: 1,
            seat_type_id: 2,
            seat_label: "V1".to_string(),
            status: seat_status::BOOKED.to_string(),
            owner_user_id: 10,
            locked_at: now - Duration::hours(2),
            expires_at: now - Duration::hours(1),
            booked_at: Some(now - Duration::hours(1)),
        };
        assert!(!seat.is_expired(now));
    }

    #[test]
    fn seat_lock_roundtrips_through_json() {
        let lock = SeatLock {
            user_id: 42,
            locked_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(600),
        };
        let json = serde_json::to_string(&lock).unwrap();
        let back: SeatLock = serde_json::from_str(&json).unwrap();
        assert_eq!(lock, back);
    }
}
