//! Entities shared by every coordination-store backend.
//!
//! The mutation helpers on [`RoundRecord`] are the single definition of the
//! round's update rules; backends differ only in how they make a helper call
//! atomic (a process-local mutex, or an optimistic compare-and-swap loop).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Side length of a bingo card grid.
pub const GRID_SIZE: usize = 5;
/// Sentinel value of the pre-marked center cell.
pub const FREE_CELL: u8 = 0;
/// Highest callable number; numbers are drawn from `1..=CALL_MAX`.
pub const CALL_MAX: u8 = 75;

/// A 5x5 card of numbers; `[row][col]`, center cell is [`FREE_CELL`].
pub type CardGrid = [[u8; GRID_SIZE]; GRID_SIZE];

/// High-level phases a round can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    /// Waiting for the next round to start; players reserve cards.
    Countdown,
    /// Numbers are being called; marks and claims are accepted.
    Active,
    /// A result is known; the round resets after the grace delay.
    Ended,
}

/// The player that won a round, as recorded in the round outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundWinner {
    /// Stable authenticated identity of the winner.
    pub identity: String,
    /// Display name at the time of the win.
    pub nickname: String,
    /// Pool slot of the winning card.
    pub slot: u8,
    /// The grid that completed a line.
    pub card: CardGrid,
}

/// Result of a finished round; `winner` is `None` when the call budget ran out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundOutcome {
    /// Winning player, if any.
    pub winner: Option<RoundWinner>,
}

/// Bounded history entry for a past round's winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RecentWinner {
    /// Display name of the winner.
    pub nickname: String,
    /// Round the win happened in.
    pub round_id: Uuid,
}

/// Authoritative coordination state for the single current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    /// Identifier regenerated on every reset.
    pub round_id: Uuid,
    /// Current phase.
    pub phase: RoundPhase,
    /// Seconds left in the countdown; zero outside the countdown phase.
    pub countdown_remaining: u32,
    /// Called numbers in call order; append-only within a round.
    pub called_numbers: Vec<u8>,
    /// Card pool for this round, regenerated on reset.
    pub card_pool: Vec<CardGrid>,
    /// Slot index (1-based) to owning identity, in reservation order.
    pub reservations: IndexMap<u8, String>,
    /// Result of the round once it has ended.
    pub outcome: Option<RoundOutcome>,
    /// Most recent winners, newest first, bounded by configuration.
    pub recent_winners: Vec<RecentWinner>,
}

/// Outcome of an atomic slot reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Reservation applied; carries the updated global taken-slot list.
    Applied {
        /// Every reserved slot index after the swap, in reservation order.
        taken: Vec<u8>,
    },
    /// At least one desired slot is held by a different identity; nothing changed.
    Blocked {
        /// Exactly the requested indices that are held by someone else.
        blocked: Vec<u8>,
    },
}

/// Outcome of releasing slots for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Slots that were actually held by the caller and are now free.
    pub released: Vec<u8>,
    /// Every still-reserved slot index after the release.
    pub taken: Vec<u8>,
}

/// Outcome of an add-if-absent append to the called-number sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Whether the number was newly inserted by this call.
    pub newly_added: bool,
    /// The full ordered call list after the operation.
    pub called_numbers: Vec<u8>,
}

impl RoundRecord {
    /// Empty bootstrap record used before the first `begin_round`.
    pub fn empty() -> Self {
        Self {
            round_id: Uuid::new_v4(),
            phase: RoundPhase::Countdown,
            countdown_remaining: 0,
            called_numbers: Vec::new(),
            card_pool: Vec::new(),
            reservations: IndexMap::new(),
            outcome: None,
            recent_winners: Vec::new(),
        }
    }

    /// Every reserved slot index, in reservation order.
    pub fn taken_slots(&self) -> Vec<u8> {
        self.reservations.keys().copied().collect()
    }

    /// Slots currently held by `identity`, in reservation order.
    pub fn slots_of(&self, identity: &str) -> Vec<u8> {
        self.reservations
            .iter()
            .filter(|(_, owner)| owner.as_str() == identity)
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Whether `number` has already been called this round.
    pub fn is_called(&self, number: u8) -> bool {
        self.called_numbers.contains(&number)
    }

    /// Reset all per-round state for a fresh round, keeping the winner history.
    pub fn begin(&mut self, pool: Vec<CardGrid>, countdown: u32) {
        self.round_id = Uuid::new_v4();
        self.phase = RoundPhase::Countdown;
        self.countdown_remaining = countdown;
        self.called_numbers.clear();
        self.card_pool = pool;
        self.reservations.clear();
        self.outcome = None;
    }

    /// Decrement the countdown by one second, clamping at zero.
    pub fn decrement_countdown(&mut self) -> u32 {
        self.countdown_remaining = self.countdown_remaining.saturating_sub(1);
        self.countdown_remaining
    }

    /// Move from countdown to active. Returns false if the round is not counting down.
    pub fn activate(&mut self) -> bool {
        if self.phase != RoundPhase::Countdown {
            return false;
        }
        self.phase = RoundPhase::Active;
        self.countdown_remaining = 0;
        true
    }

    /// Append `number` to the call sequence unless already present.
    pub fn append_called(&mut self, number: u8) -> AppendOutcome {
        let newly_added = !self.called_numbers.contains(&number)
            && self.called_numbers.len() < usize::from(CALL_MAX);
        if newly_added {
            self.called_numbers.push(number);
        }
        AppendOutcome {
            newly_added,
            called_numbers: self.called_numbers.clone(),
        }
    }

    /// Atomically swap `identity`'s reservation to `desired`.
    ///
    /// If any desired slot is held by a different identity the call has no
    /// effect and reports exactly the blocked indices; otherwise the caller's
    /// previous slots are released and the new ones claimed in one step, so a
    /// failed swap never drops a held slot.
    pub fn try_reserve(&mut self, identity: &str, desired: &[u8]) -> ReserveOutcome {
        let blocked: Vec<u8> = desired
            .iter()
            .copied()
            .filter(|slot| {
                self.reservations
                    .get(slot)
                    .is_some_and(|owner| owner != identity)
            })
            .collect();

        if !blocked.is_empty() {
            return ReserveOutcome::Blocked { blocked };
        }

        self.reservations.retain(|_, owner| owner != identity);
        for slot in desired {
            self.reservations.insert(*slot, identity.to_string());
        }

        ReserveOutcome::Applied {
            taken: self.taken_slots(),
        }
    }

    /// Release the subset of `slots` that `identity` actually holds.
    pub fn release(&mut self, identity: &str, slots: &[u8]) -> ReleaseOutcome {
        let released: Vec<u8> = slots
            .iter()
            .copied()
            .filter(|slot| {
                self.reservations
                    .get(slot)
                    .is_some_and(|owner| owner == identity)
            })
            .collect();

        for slot in &released {
            self.reservations.shift_remove(slot);
        }

        ReleaseOutcome {
            released,
            taken: self.taken_slots(),
        }
    }

    /// Release every slot held by `identity` (disconnect path).
    pub fn release_owner(&mut self, identity: &str) -> ReleaseOutcome {
        let held = self.slots_of(identity);
        self.release(identity, &held)
    }

    /// Transition the round from active to ended with the given outcome.
    ///
    /// Returns false without side effects unless the round is active, which
    /// is what guarantees at most one winner per round: concurrent claims are
    /// serialized by the backend and only the first one observes `Active`.
    pub fn finish(&mut self, outcome: RoundOutcome, winners_cap: usize) -> bool {
        if self.phase != RoundPhase::Active {
            return false;
        }
        self.phase = RoundPhase::Ended;
        if let Some(winner) = &outcome.winner {
            self.recent_winners.insert(
                0,
                RecentWinner {
                    nickname: winner.nickname.clone(),
                    round_id: self.round_id,
                },
            );
            self.recent_winners.truncate(winners_cap);
        }
        self.outcome = Some(outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_record() -> RoundRecord {
        let mut record = RoundRecord::empty();
        record.begin(vec![[[1; GRID_SIZE]; GRID_SIZE]; 10], 10);
        assert!(record.activate());
        record
    }

    fn winner(identity: &str) -> RoundOutcome {
        RoundOutcome {
            winner: Some(RoundWinner {
                identity: identity.into(),
                nickname: identity.to_uppercase(),
                slot: 1,
                card: [[0; GRID_SIZE]; GRID_SIZE],
            }),
        }
    }

    #[test]
    fn reservation_conflict_reports_exactly_blocked_slots() {
        let mut record = RoundRecord::empty();
        assert_eq!(
            record.try_reserve("alice", &[3, 7]),
            ReserveOutcome::Applied { taken: vec![3, 7] }
        );

        let outcome = record.try_reserve("bob", &[7, 9]);
        assert_eq!(outcome, ReserveOutcome::Blocked { blocked: vec![7] });

        // Alice is untouched and nothing was partially applied for Bob.
        assert_eq!(record.slots_of("alice"), vec![3, 7]);
        assert_eq!(record.slots_of("bob"), Vec::<u8>::new());
    }

    #[test]
    fn reservation_swap_is_atomic() {
        let mut record = RoundRecord::empty();
        record.try_reserve("alice", &[1, 2]);

        // Swapping to an overlapping set keeps the shared slot and frees the rest.
        assert_eq!(
            record.try_reserve("alice", &[2, 3]),
            ReserveOutcome::Applied { taken: vec![2, 3] }
        );
        assert_eq!(record.slots_of("alice"), vec![2, 3]);
    }

    #[test]
    fn failed_swap_keeps_previous_reservation() {
        let mut record = RoundRecord::empty();
        record.try_reserve("alice", &[1, 2]);
        record.try_reserve("bob", &[5]);

        assert_eq!(
            record.try_reserve("alice", &[5, 6]),
            ReserveOutcome::Blocked { blocked: vec![5] }
        );
        assert_eq!(record.slots_of("alice"), vec![1, 2]);
    }

    #[test]
    fn release_only_frees_held_subset() {
        let mut record = RoundRecord::empty();
        record.try_reserve("alice", &[4, 8]);
        record.try_reserve("bob", &[2]);

        let outcome = record.release("alice", &[2, 4, 9]);
        assert_eq!(outcome.released, vec![4]);
        assert_eq!(outcome.taken, vec![8, 2]);
    }

    #[test]
    fn append_called_deduplicates() {
        let mut record = active_record();
        assert!(record.append_called(12).newly_added);
        assert!(record.append_called(40).newly_added);

        let replay = record.append_called(12);
        assert!(!replay.newly_added);
        assert_eq!(replay.called_numbers, vec![12, 40]);
    }

    #[test]
    fn finish_succeeds_only_once() {
        let mut record = active_record();
        assert!(record.finish(winner("alice"), 10));
        assert_eq!(record.phase, RoundPhase::Ended);

        // The losing racer observes the ended phase and changes nothing.
        assert!(!record.finish(winner("bob"), 10));
        assert_eq!(
            record.outcome.as_ref().unwrap().winner.as_ref().unwrap().identity,
            "alice"
        );
    }

    #[test]
    fn finish_is_rejected_during_countdown() {
        let mut record = RoundRecord::empty();
        record.begin(Vec::new(), 10);
        assert!(!record.finish(winner("alice"), 10));
        assert_eq!(record.phase, RoundPhase::Countdown);
    }

    #[test]
    fn recent_winner_history_is_bounded() {
        let mut record = active_record();
        for i in 0..5 {
            assert!(record.finish(winner(&format!("player{i}")), 3));
            record.begin(record.card_pool.clone(), 10);
            assert!(record.activate());
        }

        assert_eq!(record.recent_winners.len(), 3);
        assert_eq!(record.recent_winners[0].nickname, "PLAYER4");
    }

    #[test]
    fn countdown_clamps_at_zero() {
        let mut record = RoundRecord::empty();
        record.begin(Vec::new(), 1);
        assert_eq!(record.decrement_countdown(), 0);
        assert_eq!(record.decrement_countdown(), 0);
    }

    #[test]
    fn begin_clears_round_state_but_keeps_history() {
        let mut record = active_record();
        record.try_reserve("alice", &[1]);
        record.append_called(7);
        assert!(record.finish(winner("alice"), 10));

        record.begin(Vec::new(), 10);
        assert!(record.called_numbers.is_empty());
        assert!(record.reservations.is_empty());
        assert!(record.outcome.is_none());
        assert_eq!(record.recent_winners.len(), 1);
    }
}
