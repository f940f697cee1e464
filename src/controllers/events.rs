//! events.rs
//!
//! Чтение событий и аналитика для организатора.
//!
//! Ядро события не создаёт и не мутирует - CRUD метаданных живёт
//! снаружи. Здесь только кешированное чтение и сводка продаж.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;

use crate::{
    error::{ApiError, Result},
    middleware::AuthUser,
    models::SeatType,
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", get(list_events))
        .route("/events/{id}", get(get_event))
        .route("/events/{id}/analytics", get(event_analytics))
}

/// GET /api/v1/events
async fn list_events(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let events = state.cache.list_published_events().await;
    let count = events.len();
    Ok(Json(json!({ "events": events, "count": count })))
}

/// GET /api/v1/events/{id}
async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let event = state
        .cache
        .get_event(event_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Event not found".to_string()))?;

    let seat_types = sqlx::query_as::<_, SeatType>(
        "SELECT id, event_id, name, price, quantity, available_quantity
         FROM event_seat_types WHERE event_id = $1 ORDER BY id",
    )
    .bind(event_id)
    .fetch_all(&state.db.pool)
    .await?;

    let mut types_payload = Vec::with_capacity(seat_types.len());
    for st in &seat_types {
        let available = state
            .cache
            .get_availability(event_id, st.id)
            .await
            .unwrap_or(st.available_quantity as i64);
        types_payload.push(json!({
            "id": st.id,
            "name": st.name,
            "price": st.price,
            "quantity": st.quantity,
            "available_quantity": available,
        }));
    }

    Ok(Json(json!({ "event": event, "seat_types": types_payload })))
}

/// GET /api/v1/events/{id}/analytics
///
/// Сводка продаж по виртуальным местам: выкуплено, в резерве, свободно,
/// выручка по подтверждённым бронированиям.
async fn event_analytics(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(event_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let event = state
        .cache
        .get_event(event_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Event not found".to_string()))?;
    if event.organizer_id != user.user_id {
        return Err(ApiError::NotFound("Event not found".to_string()));
    }

    let total_seats: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(quantity), 0)::bigint FROM event_seat_types WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_one(&state.db.pool)
    .await?;

    let (booked_seats, locked_seats): (i64, i64) = sqlx::query_as(
        "SELECT
             COUNT(*) FILTER (WHERE status = 'booked')::bigint,
             COUNT(*) FILTER (WHERE status = 'locked' AND expires_at > NOW())::bigint
         FROM seats WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_one(&state.db.pool)
    .await?;

    let revenue_row: (Option<Decimal>, i64) = sqlx::query_as(
        "SELECT SUM(total_amount), COUNT(*)::bigint
         FROM bookings
         WHERE event_id = $1 AND status = 'confirmed'",
    )
    .bind(event_id)
    .fetch_one(&state.db.pool)
    .await?;

    let (revenue, confirmed_bookings) = revenue_row;

    Ok(Json(json!({
        "event_id": event_id,
        "total_seats": total_seats,
        "booked_seats": booked_seats,
        "locked_seats": locked_seats,
        "free_seats": total_seats - booked_seats - locked_seats,
        "total_revenue": revenue.unwrap_or(Decimal::ZERO),
        "confirmed_bookings": confirmed_bookings,
    })))
}
