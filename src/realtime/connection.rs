//! connection.rs
//!
//! Реестр живых WebSocket-соединений.
//!
//! DashMap даёт конкурентный доступ без глобального мьютекса; каждое
//! соединение получает свою неограниченную mpsc-очередь исходящих
//! сообщений, так что порядок отправки в рамках соединения - FIFO.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Исходящие сообщения сериализуются один раз и шлются строками.
pub type WsSender = mpsc::UnboundedSender<String>;

pub type ConnectionId = u64;

struct ConnectionHandle {
    user_id: Option<i64>,
    tx: WsSender,
}

pub struct ConnectionManager {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_conn_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Регистрирует соединение; `user_id` присутствует только у
    /// аутентифицированных клиентов.
    pub fn add_connection(&self, user_id: Option<i64>, tx: WsSender) -> ConnectionId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .insert(conn_id, ConnectionHandle { user_id, tx });

        tracing::info!(
            conn_id,
            ?user_id,
            total_connections = self.connections.len(),
            "WebSocket connection added"
        );
        conn_id
    }

    pub fn remove_connection(&self, conn_id: ConnectionId) {
        if self.connections.remove(&conn_id).is_some() {
            tracing::info!(
                conn_id,
                remaining = self.connections.len(),
                "WebSocket connection removed"
            );
        }
    }

    pub fn user_of(&self, conn_id: ConnectionId) -> Option<i64> {
        self.connections.get(&conn_id).and_then(|c| c.user_id)
    }

    /// Рассылает сериализованное событие всем, кроме инициатора.
    ///
    /// Отказ отправки в конкретное соединение не считается ошибкой:
    /// клиент отвалился, его уберёт обработчик сокета.
    pub fn broadcast_except(&self, origin: Option<ConnectionId>, payload: &str) {
        let mut recipients = 0usize;
        for entry in self.connections.iter() {
            if Some(*entry.key()) == origin {
                continue;
            }
            if entry.value().tx.send(payload.to_string()).is_ok() {
                recipients += 1;
            }
        }
        tracing::debug!(recipients, "broadcast delivered");
    }

    /// Прямой ответ одному соединению.
    pub fn send_to(&self, conn_id: ConnectionId, payload: String) -> bool {
        self.connections
            .get(&conn_id)
            .map(|c| c.tx.send(payload).is_ok())
            .unwrap_or(false)
    }

    /// (число соединений, из них аутентифицированных)
    pub fn stats(&self) -> (usize, usize) {
        let total = self.connections.len();
        let authenticated = self
            .connections
            .iter()
            .filter(|e| e.value().user_id.is_some())
            .count();
        (total, authenticated)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_connection() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.add_connection(Some(1001), tx);
        assert_eq!(manager.stats(), (1, 1));
        assert_eq!(manager.user_of(conn_id), Some(1001));

        manager.remove_connection(conn_id);
        assert_eq!(manager.stats(), (0, 0));
    }

    #[test]
    fn anonymous_connections_are_counted_separately() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        manager.add_connection(None, tx1);
        manager.add_connection(Some(7), tx2);
        assert_eq!(manager.stats(), (2, 1));
    }

    #[test]
    fn broadcast_skips_originating_connection() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let origin = manager.add_connection(Some(1), tx1);
        manager.add_connection(Some(2), tx2);

        manager.broadcast_except(Some(origin), "{\"type\":\"seat_locked\"}");

        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), "{\"type\":\"seat_locked\"}");
    }

    #[test]
    fn send_to_unknown_connection_returns_false() {
        let manager = ConnectionManager::new();
        assert!(!manager.send_to(99, "x".to_string()));
    }
}
