//! handler.rs
//!
//! WebSocket-обработчик: апгрейд соединения, жизненный цикл и приём
//! команд от клиентов.
//!
//! Неаутентифицированные соединения получают все публичные рассылки,
//! но не могут порождать мутации. Команды аутентифицированных клиентов
//! уходят в соответствующие сервисы; публичное событие рассылается всем,
//! кроме инициатора, - тот получает прямой ответ.

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::connection::ConnectionId;
use super::messages::{WsCommand, WsReply};
use crate::{middleware::verify_token, AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /api/v1/ws?token=...
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    // Невалидный токен не рвёт соединение: клиент просто остаётся
    // анонимным слушателем.
    let user_id = match params.token.as_deref() {
        Some(token) => verify_token(&state, token).await.ok().map(|u| u.user_id),
        None => None,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: Option<i64>, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn_id = state.ws_manager.add_connection(user_id, tx.clone());

    send_reply(
        &tx,
        &WsReply::Connected {
            authenticated: user_id.is_some(),
        },
    );

    // Пересылка из канала соединения в сокет.
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Приём и диспетчеризация команд клиента.
    let recv_state = state.clone();
    let tx_for_recv = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let Ok(command) = serde_json::from_str::<WsCommand>(&text) else {
                        send_reply(
                            &tx_for_recv,
                            &WsReply::Error {
                                code: "VALIDATION".to_string(),
                                message: "Unrecognized command".to_string(),
                            },
                        );
                        continue;
                    };
                    dispatch_command(&recv_state, conn_id, user_id, command, &tx_for_recv).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    state.ws_manager.remove_connection(conn_id);
}

async fn dispatch_command(
    state: &Arc<AppState>,
    conn_id: ConnectionId,
    user_id: Option<i64>,
    command: WsCommand,
    tx: &mpsc::UnboundedSender<String>,
) {
    if matches!(command, WsCommand::Ping) {
        send_reply(tx, &WsReply::Pong);
        return;
    }

    // Мутации - только от аутентифицированных соединений.
    let Some(user_id) = user_id else {
        send_reply(
            tx,
            &WsReply::Error {
                code: "AUTH_REQUIRED".to_string(),
                message: "Authentication required to originate events".to_string(),
            },
        );
        return;
    };

    let reply = match command {
        WsCommand::LockSeat {
            event_id,
            seat_type_id,
            seat_label,
        } => state
            .locks
            .acquire(event_id, seat_type_id, &seat_label, user_id, Some(conn_id))
            .await
            .map(|lock| WsReply::LockAcquired { lock }),
        WsCommand::ReleaseSeat {
            event_id,
            seat_type_id,
            seat_label,
        } => state
            .locks
            .release(event_id, seat_type_id, &seat_label, user_id, Some(conn_id))
            .await
            .map(|released| WsReply::SeatReleased { released }),
        WsCommand::CancelBooking { booking_id, reason } => state
            .bookings
            .cancel_booking(booking_id, user_id, reason, None, Some(conn_id))
            .await
            .map(|_| WsReply::BookingCancelled { booking_id }),
        WsCommand::Ping => unreachable!("handled above"),
    };

    match reply {
        Ok(reply) => send_reply(tx, &reply),
        Err(e) => send_reply(
            tx,
            &WsReply::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        ),
    }
}

fn send_reply(tx: &mpsc::UnboundedSender<String>, reply: &WsReply) {
    if let Ok(payload) = serde_json::to_string(reply) {
        let _ = tx.send(payload);
    }
}
