//! Шина событий и рассылка в реальном времени.
//!
//! Координатор и менеджер блокировок публикуют события в `EventBus`,
//! ничего не зная о транспорте; фоновая задача `run_broadcaster`
//! подписывается на шину и доставляет события в соединения. Ошибка
//! рассылки никогда не роняет породившую её мутацию.

pub mod connection;
pub mod handler;
pub mod messages;

use connection::{ConnectionId, ConnectionManager};
use messages::LiveEvent;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Событие с отметкой соединения-инициатора: ему эхо не доставляется,
/// инициатор получает прямой ответ.
#[derive(Debug, Clone)]
pub struct Published {
    pub origin: Option<ConnectionId>,
    pub event: LiveEvent,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Published>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Публикация от имени сервера (HTTP-запросы, фоновые джобы).
    pub fn publish(&self, event: LiveEvent) {
        self.publish_from(None, event);
    }

    /// Публикация от имени соединения-инициатора.
    ///
    /// Отсутствие подписчиков - не ошибка: шина работает и без
    /// единого подключённого клиента.
    pub fn publish_from(&self, origin: Option<ConnectionId>, event: LiveEvent) {
        let _ = self.tx.send(Published { origin, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

/// Фоновая задача рассылки: шина -> все живые соединения.
pub async fn run_broadcaster(
    bus: EventBus,
    manager: Arc<ConnectionManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = bus.subscribe();
    info!("Realtime broadcaster started");

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(published) => {
                    match serde_json::to_string(&published.event) {
                        Ok(payload) => manager.broadcast_except(published.origin, &payload),
                        Err(e) => warn!("failed to serialize live event: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("broadcaster lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Realtime broadcaster stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new(16);
        bus.publish(LiveEvent::EventDeleted { event_id: 1 });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish_from(
            Some(3),
            LiveEvent::BookingConfirmed {
                booking_id: 10,
                event_id: 4,
            },
        );

        let published = rx.recv().await.unwrap();
        assert_eq!(published.origin, Some(3));
        matches!(published.event, LiveEvent::BookingConfirmed { .. });
    }
}
