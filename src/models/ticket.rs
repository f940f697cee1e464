use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub mod ticket_status {
    pub const PENDING: &str = "pending";
    pub const GENERATED: &str = "generated";
    pub const DELIVERED: &str = "delivered";
    pub const FAILED: &str = "failed";
}

/// Статусы джобы в очереди `ticket-generation`.
pub mod job_status {
    pub const WAITING: &str = "waiting";
    pub const ACTIVE: &str = "active";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const DELAYED: &str = "delayed";
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub booking_id: i64,
    pub seat_id: i64,
    pub ticket_id: String,
    pub seat_label: String,
    pub seat_type_name: String,
    pub price_paid: Decimal,
    pub qr_payload: String,
    pub status: String,
    pub email_sent: bool,
    pub sms_sent: bool,
    pub generated_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Строка персистентной очереди джобов (claim через FOR UPDATE SKIP LOCKED).
#[derive(Debug, Clone, FromRow)]
pub struct TicketJob {
    pub id: i64,
    pub kind: String,
    pub booking_id: i64,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub progress: i32,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
