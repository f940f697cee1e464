//! bookings.rs
//!
//! HTTP-поверхность бронирований.
//!
//! - Создание бронирования из удерживаемых блокировок.
//! - Список и карточка бронирований пользователя.
//! - Отмена с ключом идемпотентности.
//! - Билеты бронирования и статус джобы генерации.
//!
//! Подтверждение бронирования клиенту не выставляется: единственный
//! легитимный путь в `confirmed` - вебхук платёжного шлюза.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::{
    error::{ApiError, Result},
    middleware::AuthUser,
    services::bookings::SeatSelection,
    AppState,
};

/// Маршруты, связанные с бронированиями.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings/create", post(create_booking))
        .route("/bookings/my-bookings", get(my_bookings))
        .route("/bookings/ticket-status/{job_id}", get(ticket_job_status))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/tickets", get(booking_tickets))
}

// --- Создание ---

#[derive(Debug, Deserialize)]
struct CreateBookingRequest {
    event_id: i64,
    seat_details: Vec<SeatSelection>,
}

/// POST /api/v1/bookings/create
async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateBookingRequest>,
) -> Result<impl IntoResponse> {
    if req.event_id <= 0 {
        return Err(ApiError::Validation("event_id must be > 0".to_string()));
    }

    let (booking, seats) = state
        .bookings
        .create_booking(req.event_id, user.user_id, req.seat_details, None)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "booking": booking, "seats": seats })),
    ))
}

// --- Чтение ---

#[derive(Debug, Deserialize)]
struct MyBookingsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/v1/bookings/my-bookings?status=&limit=&offset=
async fn my_bookings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<MyBookingsQuery>,
) -> Result<impl IntoResponse> {
    if let Some(ref status) = params.status {
        if !matches!(status.as_str(), "pending" | "confirmed" | "cancelled") {
            return Err(ApiError::Validation(
                "status must be pending | confirmed | cancelled".to_string(),
            ));
        }
    }

    let bookings = state
        .bookings
        .list_user_bookings(
            user.user_id,
            params.status,
            params.limit.unwrap_or(20),
            params.offset.unwrap_or(0),
        )
        .await?;

    let count = bookings.len();
    Ok(Json(json!({ "bookings": bookings, "count": count })))
}

/// Владелец бронирования или организатор события; остальным - NOT_FOUND,
/// чтобы не раскрывать существование чужих бронирований.
async fn authorize_booking_access(
    state: &AppState,
    booking: &crate::models::Booking,
    user_id: i64,
) -> Result<()> {
    if booking.user_id == user_id {
        return Ok(());
    }
    if let Some(event) = state.cache.get_event(booking.event_id).await {
        if event.organizer_id == user_id {
            return Ok(());
        }
    }
    Err(ApiError::NotFound("Booking not found".to_string()))
}

/// GET /api/v1/bookings/{id}
async fn get_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let booking = state.bookings.get_booking(booking_id).await?;
    authorize_booking_access(&state, &booking, user.user_id).await?;

    let seats = state.bookings.get_booking_seats(booking_id).await?;
    Ok(Json(json!({ "booking": booking, "seats": seats })))
}

// --- Отмена ---

#[derive(Debug, Deserialize)]
struct CancelBookingRequest {
    reason: Option<String>,
    idempotency_key: Option<String>,
}

/// POST /api/v1/bookings/{id}/cancel
///
/// С ключом идемпотентности ретраи возвращают сохранённый ответ;
/// конкурирующая отмена того же бронирования получает IN_FLIGHT.
async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<i64>,
    Json(req): Json<CancelBookingRequest>,
) -> Result<impl IntoResponse> {
    if let Some(ref key) = req.idempotency_key {
        if key.is_empty() || key.len() > 128 {
            return Err(ApiError::Validation(
                "idempotency_key must be 1-128 characters".to_string(),
            ));
        }
    }

    let response = state
        .bookings
        .cancel_booking(booking_id, user.user_id, req.reason, req.idempotency_key, None)
        .await?;

    Ok(Json(response))
}

// --- Билеты ---

/// GET /api/v1/bookings/{id}/tickets
async fn booking_tickets(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let booking = state.bookings.get_booking(booking_id).await?;
    authorize_booking_access(&state, &booking, user.user_id).await?;

    let (tickets, aggregate) = state.tickets.get_tickets(booking_id).await?;
    Ok(Json(json!({
        "booking_id": booking_id,
        "status": aggregate,
        "tickets": tickets,
    })))
}

/// GET /api/v1/bookings/ticket-status/{job_id}
async fn ticket_job_status(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(job_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let status = state.tickets.get_job_status(job_id).await?;
    Ok(Json(status))
}
