use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    dao::models::CardGrid,
    dto::{
        common::{CardSnapshot, PlayerSnapshot, RoundSnapshot},
        validation::validate_nickname,
    },
    error::ServiceError,
};

/// Failure to turn a text frame into a usable [`ClientMessage`].
#[derive(Debug, Error)]
pub enum MessageParseError {
    /// The frame is not valid JSON for any known message.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame parsed but carried an invalid payload.
    #[error("invalid payload: {0}")]
    Validation(#[from] validator::ValidationError),
}

/// Messages accepted from game WebSocket clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Authenticate and enter the current round.
    Join {
        /// Desired display name; the verified token value wins when present.
        nickname: String,
        /// Opaque session token from the external auth collaborator.
        token: String,
        /// Optional idempotency key.
        request_id: Option<String>,
    },
    /// Request a full state snapshot (reconnect path).
    SyncState {
        /// Optional idempotency key.
        request_id: Option<String>,
    },
    /// Reserve 1-2 pool slots, atomically swapping any previous reservation.
    ReserveCards {
        /// Desired 1-based slot indices.
        slots: Vec<u8>,
        /// Optional idempotency key.
        request_id: Option<String>,
    },
    /// Release a subset of currently held slots.
    ReleaseCards {
        /// Slot indices to free.
        slots: Vec<u8>,
        /// Optional idempotency key.
        request_id: Option<String>,
    },
    /// Mark one cell of an assigned card.
    MarkCell {
        /// Index into the player's assigned cards (0 or 1).
        card_index: usize,
        /// Row of the cell, 0-4.
        row: u8,
        /// Column of the cell, 0-4.
        col: u8,
        /// Optional idempotency key.
        request_id: Option<String>,
    },
    /// Ask the server to confirm a win from marks already applied.
    ClaimBingo {
        /// Optional idempotency key.
        request_id: Option<String>,
    },
    /// Anything this server version does not understand.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse and validate a text frame.
    pub fn from_json_str(text: &str) -> Result<Self, MessageParseError> {
        let message: Self = serde_json::from_str(text)?;
        if let ClientMessage::Join { nickname, .. } = &message {
            validate_nickname(nickname)?;
        }
        Ok(message)
    }

    /// Wire name of the message, used for guard and rate-limit keys.
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::SyncState { .. } => "syncState",
            ClientMessage::ReserveCards { .. } => "reserveCards",
            ClientMessage::ReleaseCards { .. } => "releaseCards",
            ClientMessage::MarkCell { .. } => "markCell",
            ClientMessage::ClaimBingo { .. } => "claimBingo",
            ClientMessage::Unknown => "unknown",
        }
    }

    /// The idempotency key carried by the message, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join { request_id, .. }
            | ClientMessage::SyncState { request_id }
            | ClientMessage::ReserveCards { request_id, .. }
            | ClientMessage::ReleaseCards { request_id, .. }
            | ClientMessage::MarkCell { request_id, .. }
            | ClientMessage::ClaimBingo { request_id } => request_id.as_deref(),
            ClientMessage::Unknown => None,
        }
    }
}

/// Structured acknowledgement for one inbound command.
///
/// Serialized acks are recorded by the command guard, so replayed requests
/// get back a byte-identical response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Echo of the client-supplied idempotency key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Whether the command was applied.
    pub ok: bool,
    /// Machine-readable result code.
    pub code: String,
    /// Human-readable explanation.
    pub message: String,
    /// Command-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Ack {
    /// Successful ack with an optional payload.
    pub fn ok(request_id: Option<String>, data: Option<Value>) -> Self {
        Self {
            request_id,
            ok: true,
            code: "OK".into(),
            message: String::new(),
            data,
        }
    }

    /// Failed ack carrying the error taxonomy code.
    pub fn error(request_id: Option<String>, err: &ServiceError) -> Self {
        let data = match err {
            ServiceError::Conflict { blocked } => serde_json::to_value(blocked).ok(),
            _ => None,
        };
        Self {
            request_id,
            ok: false,
            code: err.code().into(),
            message: err.to_string(),
            data,
        }
    }
}

/// Messages pushed to game WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Command acknowledgement addressed to the originating client.
    Ack(Ack),
    /// Join succeeded; carries any already-assigned cards plus the round state.
    Joined {
        /// Cards already assigned to this identity (reconnect path).
        cards: Vec<CardSnapshot>,
        /// Current round snapshot.
        current_state: RoundSnapshot,
    },
    /// The caller's reservation succeeded and these cards are now theirs.
    CardsAssigned {
        /// Newly assigned cards.
        cards: Vec<CardSnapshot>,
    },
    /// The global taken-slot list changed.
    CardsTaken {
        /// Every reserved slot index after the change.
        slots: Vec<u8>,
    },
    /// Countdown tick.
    Countdown {
        /// Seconds until the round starts.
        time_left: u32,
    },
    /// The round switched to the active phase.
    GameStart,
    /// A number was called.
    NumberCalled {
        /// The newly called number.
        number: u8,
        /// Full ordered call list including `number`.
        called_numbers: Vec<u8>,
    },
    /// A mark was accepted on one of the caller's cards.
    MarkConfirmed {
        /// Index into the player's assigned cards.
        card_index: usize,
        /// Row of the marked cell.
        row: u8,
        /// Column of the marked cell.
        col: u8,
    },
    /// The round ended, with or without a winner.
    GameEnd {
        /// Winner display name, absent when the call budget ran out.
        winner_nickname: Option<String>,
        /// The grid that completed a line.
        winning_card: Option<CardGrid>,
        /// All of the winner's cards with marks, for display.
        winning_cards: Vec<CardSnapshot>,
    },
    /// Out-of-band failure addressed to one client.
    GameError {
        /// Human-readable explanation.
        message: String,
    },
    /// Full state snapshot for the requesting client.
    StateSync {
        /// Current round snapshot.
        current_state: RoundSnapshot,
        /// The caller's own player state.
        player: PlayerSnapshot,
    },
    /// A player joined the round.
    PlayerJoined {
        /// Display name of the new player.
        nickname: String,
        /// Live player count after the join.
        player_count: usize,
    },
}
