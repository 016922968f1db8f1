//! Outbound event fan-out over the per-identity connection registry.

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    dao::models::CardGrid,
    dto::{common::CardSnapshot, ws::ServerEvent},
    state::SharedState,
};

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// A closed writer is not an error here; the socket task notices on its own
/// and runs the disconnect cleanup.
pub fn send_event(tx: &mpsc::UnboundedSender<Message>, event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(payload) => {
            let _ = tx.send(Message::Text(payload.into()));
        }
        Err(err) => {
            warn!(error = %err, "failed to serialize outbound event `{event:?}`");
        }
    }
}

/// Send an event to the identity's current connection, if any.
pub fn send_to_identity(state: &SharedState, identity: &str, event: &ServerEvent) {
    let Some(tx) = state
        .players()
        .get(identity)
        .map(|player| player.tx.clone())
    else {
        return;
    };
    send_event(&tx, event);
}

/// Send an event to every joined player.
pub fn broadcast(state: &SharedState, event: &ServerEvent) {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize broadcast event `{event:?}`");
            return;
        }
    };

    for player in state.players().iter() {
        let _ = player.tx.send(Message::Text(payload.clone().into()));
    }
}

/// Broadcast one countdown tick.
pub fn broadcast_countdown(state: &SharedState, time_left: u32) {
    broadcast(state, &ServerEvent::Countdown { time_left });
}

/// Broadcast the switch to the active phase.
pub fn broadcast_game_start(state: &SharedState) {
    broadcast(state, &ServerEvent::GameStart);
}

/// Broadcast a freshly called number with the full ordered call list.
pub fn broadcast_number_called(state: &SharedState, number: u8, called_numbers: Vec<u8>) {
    broadcast(
        state,
        &ServerEvent::NumberCalled {
            number,
            called_numbers,
        },
    );
}

/// Broadcast the updated global taken-slot list.
pub fn broadcast_cards_taken(state: &SharedState, slots: Vec<u8>) {
    broadcast(state, &ServerEvent::CardsTaken { slots });
}

/// Broadcast the round result.
pub fn broadcast_game_end(
    state: &SharedState,
    winner_nickname: Option<String>,
    winning_card: Option<CardGrid>,
    winning_cards: Vec<CardSnapshot>,
) {
    broadcast(
        state,
        &ServerEvent::GameEnd {
            winner_nickname,
            winning_card,
            winning_cards,
        },
    );
}

/// Broadcast an updated player roster count after a join.
pub fn broadcast_player_joined(state: &SharedState, nickname: String, player_count: usize) {
    broadcast(
        state,
        &ServerEvent::PlayerJoined {
            nickname,
            player_count,
        },
    );
}
