//! The round engine: phase transitions, number calls, card assignment, and
//! win arbitration.
//!
//! Command handlers and tick handlers serialize their mutation sequences
//! behind the state's round gate; cross-process arbitration (slot swaps, the
//! single winner) rests on the store's atomic operations, so the engine
//! behaves identically on the in-memory and shared backends.

use std::sync::Arc;

use axum::extract::ws::Message;
use rand::seq::IndexedRandom;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    dao::{
        models::{CALL_MAX, FREE_CELL, ReserveOutcome, RoundOutcome, RoundPhase, RoundWinner},
        round_store::CoordStore,
    },
    dto::{
        common::{CardSnapshot, PlayerSnapshot, RoundSnapshot},
        ws::ServerEvent,
    },
    error::ServiceError,
    services::{auth::AuthClaims, cards, timer::TickFlow, ws_events},
    state::{
        SharedState,
        round::{Player, PlayerCard},
        state_machine::{RoundEvent, next_phase},
    },
};

/// Advisory lock that elects the process driving the timers.
const TIMER_LOCK: &str = "round-timer";
/// Lease on [`TIMER_LOCK`]; refreshed by every tick, comfortably longer than
/// any tick cadence so leadership is stable while the holder lives.
const TIMER_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(10);
/// Redraw attempts when a call races another process onto the same number.
const DRAW_ATTEMPTS: usize = 8;

/// How one invocation of the number caller left the round.
enum CallFlow {
    /// A number was called; the round stays active.
    Called,
    /// The round is no longer active (winner, exhausted budget, or reset).
    RoundOver,
}

/// Prepare the round state at process start and begin driving the clock.
///
/// Only seeds a fresh round when none exists, so joining an already-running
/// cluster leaves the shared round untouched.
pub async fn bootstrap(state: &SharedState) -> Result<(), ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;

    let mut record = store.load_round().await?;
    if record.card_pool.is_empty() {
        let pool = cards::generate_pool(state.config().pool_size);
        record = store
            .begin_round(pool, state.config().countdown_secs)
            .await?;
    }

    match record.phase {
        RoundPhase::Countdown => state.timer().start_countdown(state.clone()),
        RoundPhase::Active => state.timer().start_caller(state.clone()),
        RoundPhase::Ended => state
            .timer()
            .start_grace(state.clone(), state.config().grace_delay()),
    }
    Ok(())
}

/// One second of countdown elapsed.
pub async fn handle_countdown_tick(state: &SharedState) -> Result<TickFlow, ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;
    if !holds_timer_lock(state, &store).await? {
        return Ok(TickFlow::Continue);
    }

    let record = store.load_round().await?;
    match record.phase {
        RoundPhase::Countdown => {
            let remaining = store.decrement_countdown().await?;
            ws_events::broadcast_countdown(state, remaining);
            if remaining == 0 {
                start_active_phase(state, &store).await?;
                return Ok(TickFlow::Stop);
            }
            Ok(TickFlow::Continue)
        }
        // This ticker is out of step with the shared phase (leadership moved
        // here mid-round); hand over to the timer that matches.
        RoundPhase::Active => {
            state.timer().start_caller(state.clone());
            Ok(TickFlow::Stop)
        }
        RoundPhase::Ended => {
            state
                .timer()
                .start_grace(state.clone(), state.config().grace_delay());
            Ok(TickFlow::Stop)
        }
    }
}

/// The number-call interval elapsed.
pub async fn handle_call_tick(state: &SharedState) -> Result<TickFlow, ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;
    if !holds_timer_lock(state, &store).await? {
        return Ok(TickFlow::Continue);
    }

    let record = store.load_round().await?;
    match record.phase {
        RoundPhase::Active => match call_next_number(state, &store).await? {
            CallFlow::Called => Ok(TickFlow::Continue),
            CallFlow::RoundOver => Ok(TickFlow::Stop),
        },
        RoundPhase::Countdown => {
            state.timer().start_countdown(state.clone());
            Ok(TickFlow::Stop)
        }
        RoundPhase::Ended => {
            state
                .timer()
                .start_grace(state.clone(), state.config().grace_delay());
            Ok(TickFlow::Stop)
        }
    }
}

/// The post-round grace delay elapsed: reset everything for a new countdown.
pub async fn handle_grace_elapsed(state: &SharedState) -> Result<(), ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;
    if !holds_timer_lock(state, &store).await? {
        return Ok(());
    }

    let record = store.load_round().await?;
    if record.phase != RoundPhase::Ended {
        // Another process already reset; just realign our timers.
        if record.phase == RoundPhase::Countdown {
            state.timer().start_countdown(state.clone());
        } else {
            state.timer().start_caller(state.clone());
        }
        return Ok(());
    }
    next_phase(record.phase, RoundEvent::GraceElapsed)?;

    let pool = cards::generate_pool(state.config().pool_size);
    let fresh = store
        .begin_round(pool, state.config().countdown_secs)
        .await?;

    // Every previously assigned card reference is gone after a reset.
    for mut player in state.players().iter_mut() {
        player.cards.clear();
    }

    ws_events::broadcast_cards_taken(state, Vec::new());
    ws_events::broadcast_countdown(state, fresh.countdown_remaining);
    state.timer().start_countdown(state.clone());
    Ok(())
}

/// Register the player behind a verified identity and hand back the snapshot.
pub async fn join(
    state: &SharedState,
    claims: &AuthClaims,
    fallback_nickname: &str,
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
) -> Result<ServerEvent, ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;

    let nickname = if claims.nickname.trim().is_empty() {
        fallback_nickname.trim().to_string()
    } else {
        claims.nickname.clone()
    };

    // Capacity counts live leases cluster-wide; a rejoin of an identity we
    // already track locally does not consume a new seat.
    let already_present = state.players().contains_key(&claims.identity);
    if !already_present && store.lease_count().await? >= state.config().max_players {
        return Err(ServiceError::Capacity);
    }

    let claimed = store
        .claim_lease(
            claims.identity.clone(),
            connection_id.to_string(),
            state.config().lease_ttl(),
        )
        .await?;
    if !claimed {
        return Err(ServiceError::InvalidState(
            "identity already connected from another session".into(),
        ));
    }

    // Rehydrate cards for slots this identity still holds (crash recovery);
    // marks start over from the free center.
    let record = store.load_round().await?;
    let cards: Vec<PlayerCard> = record
        .slots_of(&claims.identity)
        .into_iter()
        .filter_map(|slot| {
            record
                .card_pool
                .get(usize::from(slot).wrapping_sub(1))
                .map(|grid| PlayerCard::new(slot, *grid))
        })
        .collect();
    let card_snapshots: Vec<CardSnapshot> = cards.iter().map(CardSnapshot::from).collect();

    state.players().insert(
        claims.identity.clone(),
        Player {
            identity: claims.identity.clone(),
            nickname: nickname.clone(),
            connection_id,
            tx,
            cards,
        },
    );

    let player_count = store.lease_count().await?;
    ws_events::broadcast_player_joined(state, nickname, player_count);

    Ok(ServerEvent::Joined {
        cards: card_snapshots,
        current_state: RoundSnapshot::from_record(
            &record,
            player_count,
            state.config().max_players,
        ),
    })
}

/// Full snapshot for the requesting client (reconnect path).
pub async fn sync_state(state: &SharedState, identity: &str) -> Result<ServerEvent, ServiceError> {
    let store = state.require_store().await?;
    let record = store.load_round().await?;
    let player_count = store.lease_count().await?;

    let player = state
        .players()
        .get(identity)
        .map(|player| PlayerSnapshot::from(&*player))
        .ok_or_else(|| ServiceError::InvalidState("player has not joined".into()))?;

    Ok(ServerEvent::StateSync {
        current_state: RoundSnapshot::from_record(
            &record,
            player_count,
            state.config().max_players,
        ),
        player,
    })
}

/// Reserve 1-2 pool slots for the caller, swapping any previous reservation.
pub async fn reserve_cards(
    state: &SharedState,
    identity: &str,
    slots: &[u8],
) -> Result<ServerEvent, ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;

    if !state.players().contains_key(identity) {
        return Err(ServiceError::InvalidState("player has not joined".into()));
    }

    let max_slots = state.config().max_slots_per_player;
    if slots.is_empty() || slots.len() > max_slots {
        return Err(ServiceError::InvalidState(format!(
            "between 1 and {max_slots} slots can be reserved"
        )));
    }
    if slots.iter().enumerate().any(|(i, slot)| slots[..i].contains(slot)) {
        return Err(ServiceError::InvalidState(
            "requested slots must be distinct".into(),
        ));
    }

    let record = store.load_round().await?;
    if record.phase == RoundPhase::Ended {
        return Err(ServiceError::InvalidState(
            "cards cannot be reserved after the round ended".into(),
        ));
    }
    let pool_size = record.card_pool.len();
    if slots
        .iter()
        .any(|slot| *slot == 0 || usize::from(*slot) > pool_size)
    {
        return Err(ServiceError::InvalidState(format!(
            "slot indices must be between 1 and {pool_size}"
        )));
    }

    match store
        .reserve_slots(identity.to_string(), slots.to_vec())
        .await?
    {
        ReserveOutcome::Blocked { blocked } => Err(ServiceError::Conflict { blocked }),
        ReserveOutcome::Applied { taken } => {
            let cards: Vec<PlayerCard> = slots
                .iter()
                .map(|slot| PlayerCard::new(*slot, record.card_pool[usize::from(*slot) - 1]))
                .collect();
            let snapshots: Vec<CardSnapshot> = cards.iter().map(CardSnapshot::from).collect();

            if let Some(mut player) = state.players().get_mut(identity) {
                player.cards = cards;
            }

            ws_events::broadcast_cards_taken(state, taken);
            Ok(ServerEvent::CardsAssigned { cards: snapshots })
        }
    }
}

/// Free the subset of the caller's slots listed in `slots`.
pub async fn release_cards(
    state: &SharedState,
    identity: &str,
    slots: &[u8],
) -> Result<Option<ServerEvent>, ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;

    if slots.is_empty() {
        return Err(ServiceError::InvalidState(
            "at least one slot must be released".into(),
        ));
    }

    let outcome = store
        .release_slots(identity.to_string(), slots.to_vec())
        .await?;

    if !outcome.released.is_empty() {
        if let Some(mut player) = state.players().get_mut(identity) {
            player.remove_cards(&outcome.released);
        }
        ws_events::broadcast_cards_taken(state, outcome.taken);
    }

    Ok(None)
}

/// Mark one cell of one of the caller's cards.
pub async fn mark_cell(
    state: &SharedState,
    identity: &str,
    card_index: usize,
    row: u8,
    col: u8,
) -> Result<ServerEvent, ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;

    let record = store.load_round().await?;
    if record.phase != RoundPhase::Active {
        return Err(ServiceError::InvalidState(
            "cells can only be marked while the round is active".into(),
        ));
    }

    let value = {
        let player = state
            .players()
            .get(identity)
            .ok_or_else(|| ServiceError::InvalidState("player has not joined".into()))?;
        let card = player
            .card(card_index)
            .ok_or_else(|| ServiceError::InvalidState("no card at this index".into()))?;
        if card.is_marked(row, col) {
            return Err(ServiceError::InvalidState("cell is already marked".into()));
        }
        card.value_at(row, col)
            .ok_or_else(|| ServiceError::InvalidState("cell is out of range".into()))?
    };

    if value != FREE_CELL && !record.is_called(value) {
        return Err(ServiceError::InvalidState(format!(
            "number {value} has not been called"
        )));
    }

    let won = {
        let mut player = state
            .players()
            .get_mut(identity)
            .ok_or_else(|| ServiceError::InvalidState("player has not joined".into()))?;
        let card = player
            .card_mut(card_index)
            .ok_or_else(|| ServiceError::InvalidState("no card at this index".into()))?;
        card.mark(row, col);
        cards::has_bingo(&card.marks)
    };

    if won {
        // Losing the finish race is fine: the mark itself stands.
        declare_winner(state, &store, record.phase, identity, card_index).await?;
    }

    Ok(ServerEvent::MarkConfirmed {
        card_index,
        row,
        col,
    })
}

/// Confirm a win from marks already applied; never auto-marks.
pub async fn claim_bingo(state: &SharedState, identity: &str) -> Result<(), ServiceError> {
    let _gate = state.round_gate().lock().await;
    let store = state.require_store().await?;

    let record = store.load_round().await?;
    if record.phase != RoundPhase::Active {
        return Err(ServiceError::InvalidState(
            "bingo can only be claimed while the round is active".into(),
        ));
    }

    let winning_index = {
        let player = state
            .players()
            .get(identity)
            .ok_or_else(|| ServiceError::InvalidState("player has not joined".into()))?;
        player
            .cards
            .iter()
            .position(|card| cards::has_bingo(&card.marks))
    };
    let Some(card_index) = winning_index else {
        return Err(ServiceError::InvalidState(
            "no card with a winning pattern yet".into(),
        ));
    };

    if !declare_winner(state, &store, record.phase, identity, card_index).await? {
        return Err(ServiceError::InvalidState("round already ended".into()));
    }
    Ok(())
}

/// Drop a connection: release its slots and seat, notify everyone else.
///
/// Safe to call concurrently with in-flight commands; if a newer connection
/// already took over the identity this is a no-op.
pub async fn disconnect(
    state: &SharedState,
    identity: &str,
    connection_id: Uuid,
) -> Result<(), ServiceError> {
    let _gate = state.round_gate().lock().await;

    let owns = state
        .players()
        .get(identity)
        .is_some_and(|player| player.connection_id == connection_id);
    if !owns {
        return Ok(());
    }
    state.players().remove(identity);

    let store = state.require_store().await?;
    let outcome = store.release_owner(identity.to_string()).await?;
    if !outcome.released.is_empty() {
        ws_events::broadcast_cards_taken(state, outcome.taken);
    }
    store
        .release_lease(identity.to_string(), connection_id.to_string())
        .await?;
    Ok(())
}

/// Whether this process currently drives the round clock.
///
/// Single-instance deployments always win this immediately; in a cluster the
/// advisory lock elects one driver and everyone else skips their ticks.
async fn holds_timer_lock(
    state: &SharedState,
    store: &Arc<dyn CoordStore>,
) -> Result<bool, ServiceError> {
    Ok(store
        .acquire_lock(
            TIMER_LOCK.to_string(),
            state.process_id().to_string(),
            TIMER_LOCK_TTL,
        )
        .await?)
}

/// Countdown hit zero: go active, announce, and call the first number now.
async fn start_active_phase(
    state: &SharedState,
    store: &Arc<dyn CoordStore>,
) -> Result<(), ServiceError> {
    next_phase(RoundPhase::Countdown, RoundEvent::CountdownFinished)?;
    if !store.set_active().await? {
        // Another process raced the transition; its caller drives the round.
        return Ok(());
    }

    ws_events::broadcast_game_start(state);
    if let CallFlow::Called = call_next_number(state, store).await? {
        state.timer().start_caller(state.clone());
    }
    Ok(())
}

/// Draw and publish the next number, ending the round at the call budget.
async fn call_next_number(
    state: &SharedState,
    store: &Arc<dyn CoordStore>,
) -> Result<CallFlow, ServiceError> {
    let record = store.load_round().await?;
    if record.phase != RoundPhase::Active {
        return Ok(CallFlow::RoundOver);
    }
    if record.called_numbers.len() >= state.config().call_budget {
        end_round_without_winner(state, store).await?;
        return Ok(CallFlow::RoundOver);
    }

    let mut called = record.called_numbers;
    for _ in 0..DRAW_ATTEMPTS {
        let Some(number) = draw_uncalled(&called) else {
            // Every number is out; the safety bound below 75 normally ends
            // rounds long before this.
            end_round_without_winner(state, store).await?;
            return Ok(CallFlow::RoundOver);
        };

        let outcome = store.append_called(number).await?;
        if outcome.newly_added {
            let reached_budget = outcome.called_numbers.len() >= state.config().call_budget;
            ws_events::broadcast_number_called(state, number, outcome.called_numbers);
            if reached_budget {
                end_round_without_winner(state, store).await?;
                return Ok(CallFlow::RoundOver);
            }
            return Ok(CallFlow::Called);
        }
        // Raced another caller onto the same number; redraw from their list.
        called = outcome.called_numbers;
    }

    Err(ServiceError::StoreConflict)
}

/// Pick a random number that has not been called yet.
fn draw_uncalled(called: &[u8]) -> Option<u8> {
    let remaining: Vec<u8> = (1..=CALL_MAX)
        .filter(|number| !called.contains(number))
        .collect();
    remaining.choose(&mut rand::rng()).copied()
}

/// End the round with no winner once the call budget is exhausted.
async fn end_round_without_winner(
    state: &SharedState,
    store: &Arc<dyn CoordStore>,
) -> Result<(), ServiceError> {
    next_phase(RoundPhase::Active, RoundEvent::CallBudgetExhausted)?;
    let finished = store
        .finish_round(
            RoundOutcome { winner: None },
            state.config().recent_winners_cap,
        )
        .await?;
    if finished {
        state.timer().stop_caller();
        ws_events::broadcast_game_end(state, None, None, Vec::new());
        state
            .timer()
            .start_grace(state.clone(), state.config().grace_delay());
    }
    Ok(())
}

/// Atomically settle the round in favor of `identity`.
///
/// Returns false when another claim won the race; the store's finish
/// operation only succeeds from the active phase, which is what guarantees
/// exactly one winner per round.
async fn declare_winner(
    state: &SharedState,
    store: &Arc<dyn CoordStore>,
    current_phase: RoundPhase,
    identity: &str,
    card_index: usize,
) -> Result<bool, ServiceError> {
    next_phase(current_phase, RoundEvent::WinnerDeclared)?;

    let (nickname, slot, card, all_cards) = {
        let player = state
            .players()
            .get(identity)
            .ok_or_else(|| ServiceError::InvalidState("player has not joined".into()))?;
        let winning = player
            .card(card_index)
            .ok_or_else(|| ServiceError::InvalidState("no card at this index".into()))?;
        (
            player.nickname.clone(),
            winning.slot,
            winning.grid,
            player.cards.iter().map(CardSnapshot::from).collect::<Vec<_>>(),
        )
    };

    let outcome = RoundOutcome {
        winner: Some(RoundWinner {
            identity: identity.to_string(),
            nickname: nickname.clone(),
            slot,
            card,
        }),
    };
    if !store
        .finish_round(outcome, state.config().recent_winners_cap)
        .await?
    {
        return Ok(false);
    }

    state.timer().stop_caller();
    ws_events::broadcast_game_end(state, Some(nickname), Some(card), all_cards);
    state
        .timer()
        .start_grace(state.clone(), state.config().grace_delay());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{CardGrid, GRID_SIZE},
            round_store::memory::MemoryCoordStore,
        },
        services::auth::DevTokenVerifier,
    };

    fn test_config() -> AppConfig {
        AppConfig {
            countdown_secs: 1,
            // Keep background tickers quiet for the duration of a test.
            call_interval_ms: 600_000,
            grace_secs: 600,
            call_budget: 5,
            max_players: 4,
            pool_size: 4,
            ..AppConfig::default()
        }
    }

    async fn engine_state(config: AppConfig) -> SharedState {
        let state = crate::state::AppState::new(config, Arc::new(DevTokenVerifier));
        state
            .install_store(Arc::new(MemoryCoordStore::new()))
            .await;
        state
    }

    /// Grid filled with `seed..seed+24` row-major, center forced free.
    fn test_grid(seed: u8) -> CardGrid {
        let mut grid = [[0u8; GRID_SIZE]; GRID_SIZE];
        let mut value = seed;
        for row in grid.iter_mut() {
            for cell in row.iter_mut() {
                *cell = value;
                value += 1;
            }
        }
        grid[2][2] = FREE_CELL;
        grid
    }

    async fn join_player(state: &SharedState, identity: &str) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let claims = AuthClaims {
            identity: identity.to_string(),
            nickname: format!("{identity}-nick"),
        };
        join(state, &claims, "fallback", Uuid::new_v4(), tx)
            .await
            .expect("join succeeds");
        rx
    }

    fn drain_events(rx: &mut UnboundedReceiver<Message>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                events.push(serde_json::from_str(&text).expect("events are JSON"));
            }
        }
        events
    }

    fn event_types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| event.get("type"))
            .filter_map(Value::as_str)
            .map(ToOwned::to_owned)
            .collect()
    }

    #[tokio::test]
    async fn join_is_capacity_limited_and_exclusive_per_identity() {
        let config = AppConfig {
            max_players: 1,
            ..test_config()
        };
        let state = engine_state(config).await;
        bootstrap(&state).await.unwrap();
        state.timer().stop_all();

        let _alice_rx = join_player(&state, "alice").await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = AuthClaims {
            identity: "bob".into(),
            nickname: "Bob".into(),
        };
        let err = join(&state, &bob, "", Uuid::new_v4(), tx).await.unwrap_err();
        assert!(matches!(err, ServiceError::Capacity));

        // Same identity from a second connection is a duplicate sign-in.
        let (tx, _rx) = mpsc::unbounded_channel();
        let alice = AuthClaims {
            identity: "alice".into(),
            nickname: "Alice".into(),
        };
        let err = join(&state, &alice, "", Uuid::new_v4(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn reservation_conflict_lists_blocked_slots_and_changes_nothing() {
        let config = AppConfig {
            pool_size: 10,
            ..test_config()
        };
        let state = engine_state(config).await;
        bootstrap(&state).await.unwrap();
        state.timer().stop_all();
        let _alice_rx = join_player(&state, "alice").await;
        let _bob_rx = join_player(&state, "bob").await;

        reserve_cards(&state, "alice", &[3, 7]).await.unwrap();

        let err = reserve_cards(&state, "bob", &[7, 9]).await.unwrap_err();
        match err {
            ServiceError::Conflict { blocked } => assert_eq!(blocked, vec![7]),
            other => panic!("expected conflict, got {other:?}"),
        }

        let store = state.require_store().await.unwrap();
        let record = store.load_round().await.unwrap();
        assert_eq!(record.slots_of("alice"), vec![3, 7]);
        assert!(record.slots_of("bob").is_empty());
        assert!(state.players().get("bob").unwrap().cards.is_empty());
    }

    #[tokio::test]
    async fn countdown_expiry_starts_the_round_and_calls_immediately() {
        let state = engine_state(test_config()).await;
        bootstrap(&state).await.unwrap();
        state.timer().stop_countdown();
        let mut rx = join_player(&state, "alice").await;
        drain_events(&mut rx);

        // countdown_secs is 1, so a single tick reaches zero.
        let flow = handle_countdown_tick(&state).await.unwrap();
        assert_eq!(flow, TickFlow::Stop);

        let store = state.require_store().await.unwrap();
        let record = store.load_round().await.unwrap();
        assert_eq!(record.phase, RoundPhase::Active);
        assert_eq!(record.called_numbers.len(), 1);

        let events = drain_events(&mut rx);
        let types = event_types(&events);
        assert_eq!(types, vec!["countdown", "gameStart", "numberCalled"]);
    }

    #[tokio::test]
    async fn call_budget_exhaustion_ends_the_round_without_a_winner() {
        let config = AppConfig {
            call_budget: 1,
            ..test_config()
        };
        let state = engine_state(config).await;
        bootstrap(&state).await.unwrap();
        state.timer().stop_countdown();
        let mut rx = join_player(&state, "alice").await;
        drain_events(&mut rx);

        handle_countdown_tick(&state).await.unwrap();

        let store = state.require_store().await.unwrap();
        let record = store.load_round().await.unwrap();
        assert_eq!(record.phase, RoundPhase::Ended);
        assert_eq!(record.called_numbers.len(), 1);

        let events = drain_events(&mut rx);
        let game_end = events
            .iter()
            .find(|event| event["type"] == "gameEnd")
            .expect("gameEnd broadcast");
        assert_eq!(game_end["winnerNickname"], Value::Null);
    }

    #[tokio::test]
    async fn marking_follows_the_called_number_rule() {
        let state = engine_state(test_config()).await;
        let store = state.require_store().await.unwrap();
        // Pool slot 1 holds a grid where (0,0)=40 and (0,1)=41.
        store.begin_round(vec![test_grid(40)], 1).await.unwrap();
        state.timer().stop_all();

        let mut rx = join_player(&state, "alice").await;
        reserve_cards(&state, "alice", &[1]).await.unwrap();

        store.set_active().await.unwrap();
        for number in [12, 40, 5] {
            store.append_called(number).await.unwrap();
        }
        drain_events(&mut rx);

        // 40 was called: the mark lands and is acknowledged.
        let event = mark_cell(&state, "alice", 0, 0, 0).await.unwrap();
        assert!(matches!(
            event,
            ServerEvent::MarkConfirmed {
                card_index: 0,
                row: 0,
                col: 0
            }
        ));

        // 41 was not called: no mutation.
        let err = mark_cell(&state, "alice", 0, 0, 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
        let player = state.players().get("alice").unwrap();
        assert!(!player.cards[0].is_marked(0, 1));
        drop(player);

        // Re-marking the same cell is rejected.
        let err = mark_cell(&state, "alice", 0, 0, 0).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn marking_during_countdown_is_rejected() {
        let state = engine_state(test_config()).await;
        let store = state.require_store().await.unwrap();
        store.begin_round(vec![test_grid(1)], 10).await.unwrap();
        state.timer().stop_all();

        let _rx = join_player(&state, "alice").await;
        reserve_cards(&state, "alice", &[1]).await.unwrap();

        let err = mark_cell(&state, "alice", 0, 0, 0).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn completing_a_row_by_marking_wins_the_round() {
        let state = engine_state(test_config()).await;
        let store = state.require_store().await.unwrap();
        store.begin_round(vec![test_grid(1)], 1).await.unwrap();
        state.timer().stop_all();

        let mut rx = join_player(&state, "alice").await;
        reserve_cards(&state, "alice", &[1]).await.unwrap();

        store.set_active().await.unwrap();
        // Row 2 of test_grid(1) is 11,12,FREE,14,15.
        for number in [11, 12, 14, 15] {
            store.append_called(number).await.unwrap();
        }
        drain_events(&mut rx);

        mark_cell(&state, "alice", 0, 2, 0).await.unwrap();
        mark_cell(&state, "alice", 0, 2, 1).await.unwrap();
        mark_cell(&state, "alice", 0, 2, 3).await.unwrap();
        mark_cell(&state, "alice", 0, 2, 4).await.unwrap();

        let record = store.load_round().await.unwrap();
        assert_eq!(record.phase, RoundPhase::Ended);
        let winner = record.outcome.unwrap().winner.unwrap();
        assert_eq!(winner.identity, "alice");
        assert_eq!(winner.slot, 1);

        let events = drain_events(&mut rx);
        let game_end = events
            .iter()
            .find(|event| event["type"] == "gameEnd")
            .expect("gameEnd broadcast");
        assert_eq!(game_end["winnerNickname"], "alice-nick");
    }

    #[tokio::test]
    async fn concurrent_claims_settle_on_exactly_one_winner() {
        let config = AppConfig {
            pool_size: 4,
            ..test_config()
        };
        let state = engine_state(config).await;
        let store = state.require_store().await.unwrap();
        store
            .begin_round(vec![test_grid(1), test_grid(26)], 1)
            .await
            .unwrap();
        state.timer().stop_all();

        let mut alice_rx = join_player(&state, "alice").await;
        let mut bob_rx = join_player(&state, "bob").await;
        reserve_cards(&state, "alice", &[1]).await.unwrap();
        reserve_cards(&state, "bob", &[2]).await.unwrap();
        store.set_active().await.unwrap();

        // Both players hold a true winning pattern before anyone claims.
        for identity in ["alice", "bob"] {
            let mut player = state.players().get_mut(identity).unwrap();
            for col in 0..GRID_SIZE as u8 {
                player.cards[0].mark(0, col);
            }
        }
        drain_events(&mut alice_rx);
        drain_events(&mut bob_rx);

        claim_bingo(&state, "alice").await.unwrap();
        let err = claim_bingo(&state, "bob").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let record = store.load_round().await.unwrap();
        assert_eq!(record.phase, RoundPhase::Ended);
        assert_eq!(
            record.outcome.unwrap().winner.unwrap().identity,
            "alice"
        );

        // Exactly one gameEnd reaches each client.
        for rx in [&mut alice_rx, &mut bob_rx] {
            let events = drain_events(rx);
            let ends = event_types(&events)
                .into_iter()
                .filter(|event_type| event_type == "gameEnd")
                .count();
            assert_eq!(ends, 1);
        }
    }

    #[tokio::test]
    async fn claim_without_a_winning_card_has_no_side_effects() {
        let state = engine_state(test_config()).await;
        let store = state.require_store().await.unwrap();
        store.begin_round(vec![test_grid(1)], 1).await.unwrap();
        state.timer().stop_all();

        let _rx = join_player(&state, "alice").await;
        reserve_cards(&state, "alice", &[1]).await.unwrap();
        store.set_active().await.unwrap();

        let err = claim_bingo(&state, "alice").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let record = store.load_round().await.unwrap();
        assert_eq!(record.phase, RoundPhase::Active);
        assert!(record.outcome.is_none());
    }

    #[tokio::test]
    async fn grace_reset_clears_everything_but_the_winner_history() {
        let state = engine_state(test_config()).await;
        let store = state.require_store().await.unwrap();
        store.begin_round(vec![test_grid(1)], 1).await.unwrap();
        state.timer().stop_all();

        let mut rx = join_player(&state, "alice").await;
        reserve_cards(&state, "alice", &[1]).await.unwrap();
        store.set_active().await.unwrap();
        store.append_called(11).await.unwrap();
        store
            .finish_round(
                RoundOutcome {
                    winner: Some(RoundWinner {
                        identity: "alice".into(),
                        nickname: "alice-nick".into(),
                        slot: 1,
                        card: test_grid(1),
                    }),
                },
                10,
            )
            .await
            .unwrap();
        drain_events(&mut rx);

        handle_grace_elapsed(&state).await.unwrap();

        let record = store.load_round().await.unwrap();
        assert_eq!(record.phase, RoundPhase::Countdown);
        assert_eq!(record.countdown_remaining, 1);
        assert!(record.called_numbers.is_empty());
        assert!(record.reservations.is_empty());
        assert_eq!(record.recent_winners.len(), 1);
        assert_eq!(record.card_pool.len(), state.config().pool_size);

        // Previously assigned cards are gone for every player.
        assert!(state.players().get("alice").unwrap().cards.is_empty());

        let events = drain_events(&mut rx);
        let types = event_types(&events);
        assert!(types.contains(&"cardsTaken".to_string()));
        assert!(types.contains(&"countdown".to_string()));

        state.timer().stop_all();
    }

    #[tokio::test]
    async fn disconnect_releases_slots_and_frees_the_seat() {
        let state = engine_state(test_config()).await;
        bootstrap(&state).await.unwrap();
        state.timer().stop_all();
        let _alice_rx = join_player(&state, "alice").await;
        let mut bob_rx = join_player(&state, "bob").await;

        reserve_cards(&state, "alice", &[1, 2]).await.unwrap();
        let connection_id = state.players().get("alice").unwrap().connection_id;
        drain_events(&mut bob_rx);

        disconnect(&state, "alice", connection_id).await.unwrap();

        assert!(state.players().get("alice").is_none());
        let store = state.require_store().await.unwrap();
        let record = store.load_round().await.unwrap();
        assert!(record.slots_of("alice").is_empty());
        assert_eq!(store.lease_count().await.unwrap(), 1);

        // Everyone saw the slots free up.
        let events = drain_events(&mut bob_rx);
        assert!(event_types(&events).contains(&"cardsTaken".to_string()));

        // The identity can join again on a new connection.
        let _rx = join_player(&state, "alice").await;
    }

    #[tokio::test]
    async fn sync_state_rebuilds_the_full_view() {
        let state = engine_state(test_config()).await;
        let store = state.require_store().await.unwrap();
        store.begin_round(vec![test_grid(1)], 7).await.unwrap();
        state.timer().stop_all();

        let _rx = join_player(&state, "alice").await;
        reserve_cards(&state, "alice", &[1]).await.unwrap();

        let event = sync_state(&state, "alice").await.unwrap();
        let ServerEvent::StateSync {
            current_state,
            player,
        } = event
        else {
            panic!("expected stateSync");
        };

        assert_eq!(current_state.phase, RoundPhase::Countdown);
        assert_eq!(current_state.countdown_remaining, 7);
        assert_eq!(current_state.taken_slots, vec![1]);
        assert_eq!(player.reserved_slots, vec![1]);
        assert_eq!(player.cards.len(), 1);
        // Center arrives pre-marked.
        assert_eq!(player.cards[0].marks, vec![(2, 2)]);
    }
}
