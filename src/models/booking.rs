use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Статусы бронирования: `pending -> confirmed` по оплате,
/// `pending -> cancelled` по отмене или таймауту. `confirmed` терминален.
pub mod booking_status {
    pub const PENDING: &str = "pending";
    pub const CONFIRMED: &str = "confirmed";
    pub const CANCELLED: &str = "cancelled";
}

pub mod payment_status {
    pub const PENDING: &str = "pending";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const REFUNDED: &str = "refunded";
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    pub reference: String,
    pub event_id: i64,
    pub user_id: i64,
    pub total_amount: Decimal,
    pub status: String,
    pub payment_status: String,
    pub payment_id: Option<String>,
    pub payment_gateway: Option<String>,
    pub booked_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_payment_window_open(&self, now: DateTime<Utc>) -> bool {
        self.status == booking_status::PENDING && self.expires_at > now
    }

    /// Уже подтверждено этим же платежом: повторная доставка вебхука.
    pub fn is_confirmed_with(&self, payment_id: &str) -> bool {
        self.status == booking_status::CONFIRMED
            && self.payment_status == payment_status::COMPLETED
            && self.payment_id.as_deref() == Some(payment_id)
    }
}

/// Связка бронирования и места с зафиксированной ценой.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BookingSeatRow {
    pub booking_id: i64,
    pub seat_id: i64,
    pub seat_label: String,
    pub seat_type_id: i64,
    pub price_paid: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn booking(status: &str, pay_status: &str, payment_id: Option<&str>) -> Booking {
        Booking {
            id: 1,
            reference: "BKG-2026-0801-120000-ABCD".to_string(),
            event_id: 1,
            user_id: 5,
            total_amount: dec!(500.00),
            status: status.to_string(),
            payment_status: pay_status.to_string(),
            payment_id: payment_id.map(str::to_string),
            payment_gateway: Some("gateway".to_string()),
            booked_at: Utc::now(),
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            expires_at: Utc::now() + Duration::minutes(15),
        }
    }

    #[test]
    fn pending_booking_within_window_is_open() {
        let b = booking(booking_status::PENDING, payment_status::PENDING, None);
        assert!(b.is_payment_window_open(Utc::now()));
        assert!(!b.is_payment_window_open(Utc::now() + Duration::minutes(16)));
    }

    #[test]
    fn repeated_webhook_detects_same_payment() {
        let b = booking(
            booking_status::CONFIRMED,
            payment_status::COMPLETED,
            Some("pay_123"),
        );
        assert!(b.is_confirmed_with("pay_123"));
        assert!(!b.is_confirmed_with("pay_456"));
    }

    #[test]
    fn pending_booking_is_not_confirmed_with_anything() {
        let b = booking(booking_status::PENDING, payment_status::PENDING, None);
        assert!(!b.is_confirmed_with("pay_123"));
    }
}
