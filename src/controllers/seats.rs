//! seats.rs
//!
//! Карта зала и операции с местами.
//!
//! - Публичная карта занятых мест с доступностью по категориям.
//! - Блокировка, освобождение и продление места (только держатель).
//! - CRUD категорий мест для организатора события.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use crate::{
    error::{ApiError, Result},
    middleware::AuthUser,
    models::SeatType,
    realtime::messages::LiveEvent,
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/seats/{event_id}", get(seat_map))
        .route("/seats/{event_id}/my-locks", get(my_locks))
        .route(
            "/seats/{event_id}/seat-types",
            post(create_seat_type),
        )
        .route(
            "/seats/{event_id}/seat-types/{seat_type_id}",
            put(update_seat_type).delete(delete_seat_type),
        )
        .route(
            "/seats/{event_id}/seat-types/{seat_type_id}/lock",
            post(lock_seat),
        )
        .route(
            "/seats/{event_id}/seat-types/{seat_type_id}/release",
            post(release_seat),
        )
        .route(
            "/seats/{event_id}/seat-types/{seat_type_id}/extend",
            post(extend_lock),
        )
}

// --- Карта зала ---

#[derive(Debug, Deserialize)]
struct SeatMapQuery {
    seat_type_id: Option<i64>,
}

/// GET /api/v1/seats/{event_id}?seat_type_id=
///
/// Места существуют виртуально: отдаём только занятые строки, свободное
/// вычисляется клиентом из `quantity` и счётчиков доступности.
async fn seat_map(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
    Query(params): Query<SeatMapQuery>,
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
        if let Some(filter) = params.seat_type_id {
            if st.id != filter {
                continue;
            }
        }
        // Доступность - из счётчика, на промахе он наполнится из БД.
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

    let taken: Vec<(String, i64, String, DateTime<Utc>)> = match params.seat_type_id {
        Some(seat_type_id) => {
            sqlx::query_as(
                "SELECT seat_label, seat_type_id, status, expires_at FROM seats
                 WHERE event_id = $1 AND seat_type_id = $2
                   AND (status = 'booked' OR expires_at > NOW())
                 ORDER BY seat_type_id, seat_label",
            )
            .bind(event_id)
            .bind(seat_type_id)
            .fetch_all(&state.db.pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT seat_label, seat_type_id, status, expires_at FROM seats
                 WHERE event_id = $1 AND (status = 'booked' OR expires_at > NOW())
                 ORDER BY seat_type_id, seat_label",
            )
            .bind(event_id)
            .fetch_all(&state.db.pool)
            .await?
        }
    };

    let seats: Vec<_> = taken
        .into_iter()
        .map(|(seat_label, seat_type_id, status, _)| {
            json!({
                "seat_label": seat_label,
                "seat_type_id": seat_type_id,
                "status": status,
            })
        })
        .collect();

    Ok(Json(json!({
        "event_id": event.id,
        "seat_types": types_payload,
        "seats": seats,
    })))
}

/// GET /api/v1/seats/{event_id}/my-locks
async fn my_locks(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(event_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let locks = state.locks.list_by_user(event_id, user.user_id).await?;
    Ok(Json(json!({ "locks": locks })))
}

// --- Блокировки ---

#[derive(Debug, Deserialize)]
struct LockSeatRequest {
    seat_label: String,
}

/// POST /api/v1/seats/{event_id}/seat-types/{seat_type_id}/lock
async fn lock_seat(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((event_id, seat_type_id)): Path<(i64, i64)>,
    Json(req): Json<LockSeatRequest>,
) -> Result<impl IntoResponse> {
    let lock = state
        .locks
        .acquire(event_id, seat_type_id, &req.seat_label, user.user_id, None)
        .await?;

    Ok((StatusCode::OK, Json(json!({ "lock": lock }))))
}

/// POST /api/v1/seats/{event_id}/seat-types/{seat_type_id}/release
async fn release_seat(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((event_id, seat_type_id)): Path<(i64, i64)>,
    Json(req): Json<LockSeatRequest>,
) -> Result<impl IntoResponse> {
    let released = state
        .locks
        .release(event_id, seat_type_id, &req.seat_label, user.user_id, None)
        .await?;

    if !released {
        return Err(ApiError::Stale(
            "Lock is not held by you or has already expired".to_string(),
        ));
    }
    Ok(Json(json!({ "released": true })))
}

#[derive(Debug, Deserialize)]
struct ExtendLockRequest {
    seat_label: String,
    additional_seconds: i64,
}

/// POST /api/v1/seats/{event_id}/seat-types/{seat_type_id}/extend
async fn extend_lock(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((event_id, seat_type_id)): Path<(i64, i64)>,
    Json(req): Json<ExtendLockRequest>,
) -> Result<impl IntoResponse> {
    let extended = state
        .locks
        .extend(
            event_id,
            seat_type_id,
            &req.seat_label,
            user.user_id,
            req.additional_seconds,
        )
        .await?;

    if !extended {
        return Err(ApiError::Stale(
            "Lock is not held by you or has already expired".to_string(),
        ));
    }
    Ok(Json(json!({ "extended": true })))
}

// --- Категории мест (только организатор) ---

async fn require_organizer(state: &AppState, event_id: i64, user_id: i64) -> Result<()> {
    let event = state
        .cache
        .get_event(event_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Event not found".to_string()))?;
    if event.organizer_id != user_id {
        return Err(ApiError::NotFound("Event not found".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
struct CreateSeatTypeRequest {
    #[validate(length(min = 1, max = 100))]
    name: String,
    price: Decimal,
    #[validate(range(min = 0))]
    quantity: i32,
}

/// POST /api/v1/seats/{event_id}/seat-types
async fn create_seat_type(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(event_id): Path<i64>,
    Json(req): Json<CreateSeatTypeRequest>,
) -> Result<impl IntoResponse> {
    require_organizer(&state, event_id, user.user_id).await?;
    req.validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    if req.price < Decimal::ZERO {
        return Err(ApiError::Validation("price must be >= 0".to_string()));
    }

    let seat_type = sqlx::query_as::<_, SeatType>(
        "INSERT INTO event_seat_types (event_id, name, price, quantity, available_quantity)
         VALUES ($1, $2, $3, $4, $4)
         RETURNING id, event_id, name, price, quantity, available_quantity",
    )
    .bind(event_id)
    .bind(&req.name)
    .bind(req.price)
    .bind(req.quantity)
    .fetch_one(&state.db.pool)
    .await?;

    state.cache.invalidate_event(event_id).await;
    state.bus.publish(LiveEvent::SeatTypeCreated {
        event_id,
        seat_type: seat_type.clone(),
    });

    Ok((StatusCode::CREATED, Json(seat_type)))
}

#[derive(Debug, Deserialize)]
struct UpdateSeatTypeRequest {
    name: Option<String>,
    price: Option<Decimal>,
    quantity: Option<i32>,
}

/// PUT /api/v1/seats/{event_id}/seat-types/{seat_type_id}
///
/// Изменение `quantity` сдвигает доступность на ту же дельту
/// (с клампом снизу нулём).
async fn update_seat_type(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((event_id, seat_type_id)): Path<(i64, i64)>,
    Json(req): Json<UpdateSeatTypeRequest>,
) -> Result<impl IntoResponse> {
    require_organizer(&state, event_id, user.user_id).await?;
    if let Some(price) = req.price {
        if price < Decimal::ZERO {
            return Err(ApiError::Validation("price must be >= 0".to_string()));
        }
    }
    if let Some(quantity) = req.quantity {
        if quantity < 0 {
            return Err(ApiError::Validation("quantity must be >= 0".to_string()));
        }
    }

    let seat_type = sqlx::query_as::<_, SeatType>(
        "UPDATE event_seat_types
         SET name = COALESCE($3, name),
             price = COALESCE($4, price),
             available_quantity = CASE
                 WHEN $5::int IS NOT NULL
                     THEN GREATEST(0, available_quantity + ($5 - quantity))
                 ELSE available_quantity
             END,
             quantity = COALESCE($5, quantity)
         WHERE id = $2 AND event_id = $1
         RETURNING id, event_id, name, price, quantity, available_quantity",
    )
    .bind(event_id)
    .bind(seat_type_id)
    .bind(req.name)
    .bind(req.price)
    .bind(req.quantity)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("Seat type not found".to_string()))?;

    state.cache.invalidate_availability(event_id, seat_type_id).await;
    state.cache.invalidate_event(event_id).await;
    state.bus.publish(LiveEvent::SeatTypeUpdated {
        event_id,
        seat_type_id,
        available_quantity: seat_type.available_quantity as i64,
    });

    Ok(Json(seat_type))
}

/// DELETE /api/v1/seats/{event_id}/seat-types/{seat_type_id}
async fn delete_seat_type(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((event_id, seat_type_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse> {
    require_organizer(&state, event_id, user.user_id).await?;

    // Живые резервы и выкупленные места не дают удалить категорию.
    let has_live_seats: bool = sqlx::query_scalar(
        "SELECT EXISTS(
             SELECT 1 FROM seats
             WHERE seat_type_id = $1 AND (status = 'booked' OR expires_at > NOW())
         )",
    )
    .bind(seat_type_id)
    .fetch_one(&state.db.pool)
    .await?;
    if has_live_seats {
        return Err(ApiError::Conflict(
            "Seat type has active reservations and cannot be deleted".to_string(),
        ));
    }

    let deleted = sqlx::query("DELETE FROM event_seat_types WHERE id = $1 AND event_id = $2")
        .bind(seat_type_id)
        .bind(event_id)
        .execute(&state.db.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound("Seat type not found".to_string()));
    }

    state.cache.invalidate_availability(event_id, seat_type_id).await;
    state.cache.invalidate_event(event_id).await;
    state.bus.publish(LiveEvent::SeatTypeDeleted {
        event_id,
        seat_type_id,
    });

    Ok(Json(json!({ "deleted": true })))
}
