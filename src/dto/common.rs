use serde::Serialize;

use crate::{
    dao::models::{CardGrid, RecentWinner, RoundPhase, RoundRecord},
    state::round::{Player, PlayerCard},
};

/// Snapshot of the shared round state, sufficient for a client to render the
/// game after a reconnect without replaying history.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    /// Current phase.
    pub phase: RoundPhase,
    /// Seconds left in the countdown; zero outside the countdown phase.
    pub countdown_remaining: u32,
    /// Called numbers in call order.
    pub called_numbers: Vec<u8>,
    /// Every reserved slot index.
    pub taken_slots: Vec<u8>,
    /// Number of cards in the pool.
    pub pool_size: usize,
    /// Configured player limit.
    pub max_players: usize,
    /// Players currently holding a live presence lease.
    pub player_count: usize,
    /// Winner of the round once it has ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_nickname: Option<String>,
    /// Most recent round winners, newest first.
    pub recent_winners: Vec<RecentWinner>,
}

impl RoundSnapshot {
    /// Build a snapshot from the authoritative record plus presence data.
    pub fn from_record(record: &RoundRecord, player_count: usize, max_players: usize) -> Self {
        Self {
            phase: record.phase,
            countdown_remaining: record.countdown_remaining,
            called_numbers: record.called_numbers.clone(),
            taken_slots: record.taken_slots(),
            pool_size: record.card_pool.len(),
            max_players,
            player_count,
            winner_nickname: match record.phase {
                RoundPhase::Ended => record
                    .outcome
                    .as_ref()
                    .and_then(|outcome| outcome.winner.as_ref())
                    .map(|winner| winner.nickname.clone()),
                _ => None,
            },
            recent_winners: record.recent_winners.clone(),
        }
    }
}

/// One assigned card with the player's marks.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CardSnapshot {
    /// Pool slot this card occupies.
    pub slot: u8,
    /// The 5x5 number grid.
    pub grid: CardGrid,
    /// Marked coordinates as `[row, col]` pairs, center included.
    pub marks: Vec<(u8, u8)>,
}

impl From<&PlayerCard> for CardSnapshot {
    fn from(card: &PlayerCard) -> Self {
        let mut marks: Vec<(u8, u8)> = card.marks.iter().copied().collect();
        marks.sort_unstable();
        Self {
            slot: card.slot,
            grid: card.grid,
            marks,
        }
    }
}

/// Per-player view sent alongside the round snapshot in `stateSync`.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    /// Display name.
    pub nickname: String,
    /// Slots held by this player.
    pub reserved_slots: Vec<u8>,
    /// Assigned cards with their marks.
    pub cards: Vec<CardSnapshot>,
}

impl From<&Player> for PlayerSnapshot {
    fn from(player: &Player) -> Self {
        Self {
            nickname: player.nickname.clone(),
            reserved_slots: player.cards.iter().map(|card| card.slot).collect(),
            cards: player.cards.iter().map(CardSnapshot::from).collect(),
        }
    }
}
