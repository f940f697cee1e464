//! mod.rs
//!
//! Корневой модуль маршрутизации API (всё под /api/v1).

pub mod bookings;
pub mod events;
pub mod payments;
pub mod seats;

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::AppState;

/// Собирает главный маршрутизатор приложения.
///
/// Аутентификация навешана на уровне обработчиков через экстрактор
/// `AuthUser`: публичные и защищённые маршруты живут в одном роутере.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(bookings::routes())
        .merge(events::routes())
        .merge(payments::routes())
        .merge(seats::routes())
        .route("/ws", get(crate::realtime::handler::ws_handler))
}
