pub mod cache;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod realtime;
pub mod redis_client;
pub mod services;

use std::sync::Arc;

// Общий контекст приложения: корень композиции собирает каждый
// коллаборатор ровно один раз и раздаёт обработчикам неизменяемые хэндлы.
pub struct AppState {
    pub db: database::Database,
    pub redis: redis_client::RedisClient,
    pub cache: cache::CacheService,
    pub config: config::Config,
    pub bus: realtime::EventBus,
    pub ws_manager: Arc<realtime::connection::ConnectionManager>,
    pub locks: services::locks::SeatLockManager,
    pub bookings: services::bookings::BookingCoordinator,
    pub payments: services::payment::PaymentService,
    pub tickets: services::tickets::TicketService,
}
