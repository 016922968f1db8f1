//! Per-connection WebSocket lifecycle: identification, command dispatch, and
//! disconnect cleanup.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{Ack, ClientMessage, ServerEvent},
    error::ServiceError,
    services::{command_guard, presence, round_engine, ws_events},
    state::SharedState,
};

/// How long a fresh socket gets to send its `join` message.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle the full lifecycle for an individual game WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we
    // await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // The first frame must be a join; everything else is a protocol error.
    let join_message = match tokio::time::timeout(JOIN_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error before join");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(_) => {
            warn!("websocket join timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let (nickname, token, join_request_id) = match ClientMessage::from_json_str(&join_message) {
        Ok(ClientMessage::Join {
            nickname,
            token,
            request_id,
        }) => (nickname, token, request_id),
        Ok(_) => {
            warn!("first websocket message was not a join");
            ws_events::send_event(
                &outbound_tx,
                &ServerEvent::GameError {
                    message: "expected a join message first".into(),
                },
            );
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to parse or validate join message");
            ws_events::send_event(
                &outbound_tx,
                &ServerEvent::GameError {
                    message: err.to_string(),
                },
            );
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    // Auth is a black box: any failure is Unauthorized, nothing else.
    let claims = match state.auth().verify(&token).await {
        Ok(claims) => claims,
        Err(err) => {
            let ack = Ack::error(
                join_request_id,
                &ServiceError::Unauthorized(err.to_string()),
            );
            ws_events::send_event(&outbound_tx, &ServerEvent::Ack(ack));
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let identity = claims.identity.clone();
    let connection_id = Uuid::new_v4();

    let join_ack = {
        let engine_state = state.clone();
        let engine_tx = outbound_tx.clone();
        let engine_claims = claims.clone();
        let engine_nickname = nickname.clone();
        let ack_request_id = join_request_id.clone();
        command_guard::run_guarded(
            &state,
            &identity,
            "join",
            join_request_id.as_deref(),
            move || async move {
                let result = round_engine::join(
                    &engine_state,
                    &engine_claims,
                    &engine_nickname,
                    connection_id,
                    engine_tx.clone(),
                )
                .await;
                match result {
                    Ok(event) => {
                        ws_events::send_event(&engine_tx, &event);
                        Ack::ok(ack_request_id, serde_json::to_value(&event).ok())
                    }
                    Err(err) => Ack::error(ack_request_id, &err),
                }
            },
        )
        .await
    };
    let joined = join_ack.ok;
    ws_events::send_event(&outbound_tx, &ServerEvent::Ack(join_ack));
    if !joined {
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    }

    info!(identity = %identity, connection = %connection_id, "player connected");

    let refresh_task = presence::spawn_refresh_task(
        state.clone(),
        identity.clone(),
        connection_id.to_string(),
    );

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match ClientMessage::from_json_str(&text) {
                Ok(ClientMessage::Join { request_id, .. }) => {
                    let ack = Ack::error(
                        request_id,
                        &ServiceError::InvalidState("already joined".into()),
                    );
                    ws_events::send_event(&outbound_tx, &ServerEvent::Ack(ack));
                }
                Ok(ClientMessage::Unknown) => {
                    warn!(identity = %identity, "ignoring unknown message type");
                }
                Ok(command) => {
                    let ack = dispatch(&state, &identity, &outbound_tx, command).await;
                    ws_events::send_event(&outbound_tx, &ServerEvent::Ack(ack));
                }
                Err(err) => {
                    warn!(identity = %identity, error = %err, "failed to parse or validate message");
                    ws_events::send_event(
                        &outbound_tx,
                        &ServerEvent::GameError {
                            message: err.to_string(),
                        },
                    );
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(identity = %identity, error = %err, "websocket error");
                break;
            }
        }
    }

    refresh_task.abort();
    if let Err(err) = round_engine::disconnect(&state, &identity, connection_id).await {
        warn!(identity = %identity, error = %err, "disconnect cleanup failed");
    }
    info!(identity = %identity, connection = %connection_id, "player disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Run one authenticated command through the guard and into the engine.
async fn dispatch(
    state: &SharedState,
    identity: &str,
    tx: &mpsc::UnboundedSender<Message>,
    command: ClientMessage,
) -> Ack {
    let action = command.action();
    let request_id = command.request_id().map(ToOwned::to_owned);

    let engine_state = state.clone();
    let engine_identity = identity.to_string();
    let tx = tx.clone();
    let ack_request_id = request_id.clone();
    command_guard::run_guarded(
        state,
        identity,
        action,
        request_id.as_deref(),
        move || async move {
            let direct_event = match command {
                ClientMessage::SyncState { .. } => {
                    round_engine::sync_state(&engine_state, &engine_identity)
                        .await
                        .map(Some)
                }
                ClientMessage::ReserveCards { slots, .. } => {
                    round_engine::reserve_cards(&engine_state, &engine_identity, &slots)
                        .await
                        .map(Some)
                }
                ClientMessage::ReleaseCards { slots, .. } => {
                    round_engine::release_cards(&engine_state, &engine_identity, &slots).await
                }
                ClientMessage::MarkCell {
                    card_index,
                    row,
                    col,
                    ..
                } => round_engine::mark_cell(&engine_state, &engine_identity, card_index, row, col)
                    .await
                    .map(Some),
                ClientMessage::ClaimBingo { .. } => {
                    round_engine::claim_bingo(&engine_state, &engine_identity)
                        .await
                        .map(|()| None)
                }
                // Join and Unknown are handled before dispatch.
                ClientMessage::Join { .. } | ClientMessage::Unknown => {
                    Err(ServiceError::InvalidState("unexpected command".into()))
                }
            };

            match direct_event {
                Ok(Some(event)) => {
                    ws_events::send_event(&tx, &event);
                    Ack::ok(ack_request_id, serde_json::to_value(&event).ok())
                }
                Ok(None) => Ack::ok(ack_request_id, None),
                Err(err) => Ack::error(ack_request_id, &err),
            }
        },
    )
    .await
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
