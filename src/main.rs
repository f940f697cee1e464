use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bookd::{
    cache::CacheService,
    config::Config,
    controllers,
    database::Database,
    realtime::{self, connection::ConnectionManager, EventBus},
    redis_client::RedisClient,
    services::{
        bookings::BookingCoordinator,
        idempotency::IdempotencyStore,
        locks::SeatLockManager,
        payment::{PaymentGatewayClient, PaymentService},
        sweeper::ExpirySweeper,
        tickets::TicketService,
    },
    AppState,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.app.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting bookd booking engine");

    let db = Database::new(&config.database.url, config.database.pool_size).await?;
    info!("Database connected");

    db.run_migrations().await?;

    let redis = RedisClient::new(&config.redis.url).await?;
    info!("Redis connected");

    let cache = CacheService::new(redis.clone(), db.clone());
    cache.warmup_cache().await;

    // Корень композиции: каждый коллаборатор конструируется один раз.
    let bus = EventBus::new(1024);
    let ws_manager = Arc::new(ConnectionManager::new());
    let idempotency = IdempotencyStore::new(db.clone());
    let tickets = TicketService::new(db.clone(), bus.clone(), config.notifications.clone());
    let bookings = BookingCoordinator::new(
        db.clone(),
        cache.clone(),
        bus.clone(),
        idempotency,
        tickets.clone(),
        config.booking.clone(),
    );
    let locks = SeatLockManager::new(
        db.clone(),
        cache.clone(),
        bus.clone(),
        config.booking.clone(),
    );
    let gateway_client = Arc::new(PaymentGatewayClient::from_config(
        &config.payment,
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.timeout_seconds,
    ));
    let payments = PaymentService::new(
        db.clone(),
        gateway_client,
        bookings.clone(),
        config.payment.clone(),
    );

    let app_state = Arc::new(AppState {
        db: db.clone(),
        redis: redis.clone(),
        cache: cache.clone(),
        config: config.clone(),
        bus: bus.clone(),
        ws_manager: ws_manager.clone(),
        locks,
        bookings: bookings.clone(),
        payments,
        tickets: tickets.clone(),
    });

    // Фоновые задачи живут до сигнала остановки.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = JoinSet::new();

    background.spawn(realtime::run_broadcaster(
        bus.clone(),
        ws_manager.clone(),
        shutdown_rx.clone(),
    ));

    for worker_id in 0..config.booking.ticket_workers {
        let worker = tickets.clone();
        let rx = shutdown_rx.clone();
        background.spawn(async move {
            worker.run_worker(worker_id, rx).await;
        });
    }

    let sweeper = ExpirySweeper::new(
        db.clone(),
        redis.clone(),
        cache.clone(),
        bus.clone(),
        bookings.clone(),
        tickets.clone(),
    );

    {
        let sweeper = sweeper.clone();
        let mut rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.booking.sweep_interval_seconds);
        background.spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => sweeper.run_lock_sweep().await,
                    _ = rx.changed() => if *rx.borrow() { break },
                }
            }
        });
    }
    {
        let sweeper = sweeper.clone();
        let mut rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.booking.token_sweep_interval_seconds);
        background.spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => sweeper.run_token_sweep().await,
                    _ = rx.changed() => if *rx.borrow() { break },
                }
            }
        });
    }

    let app = Router::new()
        .route("/", get(|| async { "bookd API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api/v1", controllers::routes())
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Остановка: новые запросы не принимаются, воркеры дорабатывают
    // текущую джобу, затем закрываем пулы. Жёсткий дедлайн - 10 секунд.
    info!("Shutting down: draining background workers");
    let _ = shutdown_tx.send(true);
    let drain = async {
        while background.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("Background workers did not drain in time, aborting");
        background.abort_all();
    }

    db.pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
