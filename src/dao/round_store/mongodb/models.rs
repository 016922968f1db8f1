use indexmap::IndexMap;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dao::models::{CardGrid, RecentWinner, RoundOutcome, RoundPhase, RoundRecord};

/// Fixed `_id` of the single round document.
pub const ROUND_DOC_ID: &str = "current";

/// One reserved slot inside the round document.
///
/// BSON maps require string keys, so the entity's ordered reservation map is
/// flattened into an ordered array for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationEntry {
    /// 1-based pool slot index.
    pub slot: u8,
    /// Owning identity.
    pub identity: String,
}

/// Versioned persistence shape of [`RoundRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundDocument {
    /// Always [`ROUND_DOC_ID`]; there is exactly one live round.
    #[serde(rename = "_id")]
    pub id: String,
    /// Identifier regenerated on every reset.
    pub round_id: Uuid,
    /// Current phase.
    pub phase: RoundPhase,
    /// Seconds left in the countdown.
    pub countdown_remaining: u32,
    /// Called numbers in call order.
    pub called_numbers: Vec<u8>,
    /// Card pool for this round.
    pub card_pool: Vec<CardGrid>,
    /// Reserved slots in reservation order.
    pub reservations: Vec<ReservationEntry>,
    /// Result of the round once ended.
    pub outcome: Option<RoundOutcome>,
    /// Most recent winners, newest first.
    pub recent_winners: Vec<RecentWinner>,
    /// Monotonic counter backing the compare-and-swap discipline.
    pub version: i64,
}

impl RoundDocument {
    /// Persistence shape for `record` at the given version.
    pub fn from_record(record: &RoundRecord, version: i64) -> Self {
        Self {
            id: ROUND_DOC_ID.to_string(),
            round_id: record.round_id,
            phase: record.phase,
            countdown_remaining: record.countdown_remaining,
            called_numbers: record.called_numbers.clone(),
            card_pool: record.card_pool.clone(),
            reservations: record
                .reservations
                .iter()
                .map(|(slot, identity)| ReservationEntry {
                    slot: *slot,
                    identity: identity.clone(),
                })
                .collect(),
            outcome: record.outcome.clone(),
            recent_winners: record.recent_winners.clone(),
            version,
        }
    }

    /// Rebuild the entity, dropping the persistence-only version counter.
    pub fn into_record(self) -> RoundRecord {
        RoundRecord {
            round_id: self.round_id,
            phase: self.phase,
            countdown_remaining: self.countdown_remaining,
            called_numbers: self.called_numbers,
            card_pool: self.card_pool,
            reservations: self
                .reservations
                .into_iter()
                .map(|entry| (entry.slot, entry.identity))
                .collect::<IndexMap<_, _>>(),
            outcome: self.outcome,
            recent_winners: self.recent_winners,
        }
    }
}

/// Recorded command response, evicted by a TTL index on `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardDocument {
    /// `actor:action:request_id` idempotency key.
    #[serde(rename = "_id")]
    pub key: String,
    /// Serialized ack to replay.
    pub response: String,
    /// Expiry instant.
    pub expires_at: DateTime,
}

/// Rate-limit window counter per `actor:action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDocument {
    /// `actor:action` key.
    #[serde(rename = "_id")]
    pub key: String,
    /// Instant the current window opened.
    pub window_start: DateTime,
    /// Actions counted inside the window.
    pub count: i32,
}

/// Presence lease document, evicted by a TTL index on `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseDocument {
    /// Leased identity.
    #[serde(rename = "_id")]
    pub identity: String,
    /// Token of the holding connection.
    pub token: String,
    /// Expiry instant.
    pub expires_at: DateTime,
}

/// Named advisory lock document, evicted by a TTL index on `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDocument {
    /// Lock name.
    #[serde(rename = "_id")]
    pub name: String,
    /// Identifier of the holding process.
    pub holder: String,
    /// Expiry instant.
    pub expires_at: DateTime,
}

/// Current instant shifted forward by `ttl`, as a BSON datetime.
pub fn expiry_after(ttl: std::time::Duration) -> DateTime {
    DateTime::from_system_time(std::time::SystemTime::now() + ttl)
}

/// Current instant shifted backward by `window`, as a BSON datetime.
pub fn window_threshold(window: std::time::Duration) -> DateTime {
    DateTime::from_system_time(
        std::time::SystemTime::now()
            .checked_sub(window)
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
    )
}
