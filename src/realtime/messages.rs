//! messages.rs
//!
//! Типы сообщений реального времени: публичные события жизненного цикла,
//! команды от аутентифицированных клиентов и прямые ответы соединению.

use crate::models::{SeatLock, SeatType};
use serde::{Deserialize, Serialize};

/// Публичное событие, рассылаемое всем подключённым клиентам.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    EventCreated {
        event_id: i64,
    },
    EventUpdated {
        event_id: i64,
    },
    EventDeleted {
        event_id: i64,
    },
    SeatTypeCreated {
        event_id: i64,
        seat_type: SeatType,
    },
    SeatTypeUpdated {
        event_id: i64,
        seat_type_id: i64,
        available_quantity: i64,
    },
    SeatTypeDeleted {
        event_id: i64,
        seat_type_id: i64,
    },
    SeatLocked {
        event_id: i64,
        seat_type_id: i64,
        seat_label: String,
        user_id: i64,
        available_quantity: i64,
        lock: SeatLock,
    },
    BookingCreated {
        booking_id: i64,
        event_id: i64,
        user_id: i64,
    },
    BookingConfirmed {
        booking_id: i64,
        event_id: i64,
    },
    BookingCancelled {
        booking_id: i64,
        event_id: i64,
    },
    TicketsReady {
        booking_id: i64,
        ticket_count: i64,
    },
}

/// Команда клиента: зеркало мутирующих операций ядра.
/// Принимается только от аутентифицированных соединений.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsCommand {
    LockSeat {
        event_id: i64,
        seat_type_id: i64,
        seat_label: String,
    },
    ReleaseSeat {
        event_id: i64,
        seat_type_id: i64,
        seat_label: String,
    },
    CancelBooking {
        booking_id: i64,
        reason: Option<String>,
    },
    Ping,
}

/// Прямой ответ соединению-инициатору (не рассылается остальным).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsReply {
    Connected { authenticated: bool },
    LockAcquired { lock: SeatLock },
    SeatReleased { released: bool },
    BookingCancelled { booking_id: i64 },
    Error { code: String, message: String },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn live_event_uses_snake_case_tag() {
        let event = LiveEvent::TicketsReady {
            booking_id: 5,
            ticket_count: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"tickets_ready\""));
        assert!(json.contains("\"ticket_count\":2"));
    }

    #[test]
    fn seat_locked_carries_lock_payload() {
        let now = Utc::now();
        let event = LiveEvent::SeatLocked {
            event_id: 1,
            seat_type_id: 2,
            seat_label: "V1".to_string(),
            user_id: 3,
            available_quantity: 99,
            lock: SeatLock {
                user_id: 3,
                locked_at: now,
                expires_at: now,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"seat_locked\""));
        assert!(json.contains("\"available_quantity\":99"));
    }

    #[test]
    fn ws_command_parses_lock_seat() {
        let cmd: WsCommand = serde_json::from_str(
            r#"{"action":"lock_seat","event_id":1,"seat_type_id":2,"seat_label":"A7"}"#,
        )
        .unwrap();
        matches!(cmd, WsCommand::LockSeat { .. });
    }
}
