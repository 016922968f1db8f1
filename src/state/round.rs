use std::collections::HashSet;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dao::models::{CardGrid, GRID_SIZE};

/// Marked `(row, col)` coordinates on one card.
pub type MarkSet = HashSet<(u8, u8)>;

/// Row and column of the always-free center cell.
pub const CENTER: (u8, u8) = (2, 2);

/// One card assigned to a player, with that player's own marks.
///
/// Grids are cloned out of the shared pool on assignment so marks on one
/// player's copy never leak into another's.
#[derive(Debug, Clone)]
pub struct PlayerCard {
    /// 1-based pool slot this card was reserved from.
    pub slot: u8,
    /// The number grid.
    pub grid: CardGrid,
    /// Marked coordinates; the center is pre-marked.
    pub marks: MarkSet,
}

impl PlayerCard {
    /// Assign the grid at `slot`, pre-marking the free center.
    pub fn new(slot: u8, grid: CardGrid) -> Self {
        let mut marks = MarkSet::new();
        marks.insert(CENTER);
        Self { slot, grid, marks }
    }

    /// The number printed at `(row, col)`; the free sentinel for the center.
    pub fn value_at(&self, row: u8, col: u8) -> Option<u8> {
        let row = usize::from(row);
        let col = usize::from(col);
        if row >= GRID_SIZE || col >= GRID_SIZE {
            return None;
        }
        Some(self.grid[row][col])
    }

    /// Whether `(row, col)` is already marked.
    pub fn is_marked(&self, row: u8, col: u8) -> bool {
        self.marks.contains(&(row, col))
    }

    /// Record a mark at `(row, col)`.
    pub fn mark(&mut self, row: u8, col: u8) {
        self.marks.insert((row, col));
    }
}

/// A joined player: stable identity, transient connection, assigned cards.
#[derive(Debug)]
pub struct Player {
    /// Stable authenticated identity, not the socket id.
    pub identity: String,
    /// Display name from the verified token.
    pub nickname: String,
    /// Id of the socket currently speaking for this identity; changes on
    /// reconnect while `identity` stays the same.
    pub connection_id: Uuid,
    /// Writer channel of the current socket.
    pub tx: mpsc::UnboundedSender<Message>,
    /// Cards assigned from the player's reserved slots.
    pub cards: Vec<PlayerCard>,
}

impl Player {
    /// Card at `card_index`, if assigned.
    pub fn card(&self, card_index: usize) -> Option<&PlayerCard> {
        self.cards.get(card_index)
    }

    /// Mutable card at `card_index`, if assigned.
    pub fn card_mut(&mut self, card_index: usize) -> Option<&mut PlayerCard> {
        self.cards.get_mut(card_index)
    }

    /// Drop the cards whose slots appear in `released`.
    pub fn remove_cards(&mut self, released: &[u8]) {
        self.cards.retain(|card| !released.contains(&card.slot));
    }
}
