//! Wall-clock scheduling for the round engine.
//!
//! Owns three cancellable tasks: the one-second countdown ticker, the
//! number-call ticker, and the one-shot grace timer between rounds. The
//! tasks hold no game state; every tick calls back into the engine, which
//! reads and mutates state through the store.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::warn;

use crate::{services::round_engine, state::SharedState};

/// Whether a periodic tick loop should keep running after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    /// Keep ticking.
    Continue,
    /// The phase moved on; this ticker is done.
    Stop,
}

/// Cancellable countdown, number-call, and grace timers.
///
/// Started and stopped only by explicit engine phase-transition calls. A
/// ticker awaits its engine callback before sleeping again, so two ticks of
/// the same timer can never overlap; overlapping wall-clock deadlines are
/// skipped rather than queued.
pub struct TimerService {
    countdown: Mutex<Option<JoinHandle<()>>>,
    caller: Mutex<Option<JoinHandle<()>>>,
    grace: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Create the service with no timers running.
    pub fn new() -> Self {
        Self {
            countdown: Mutex::new(None),
            caller: Mutex::new(None),
            grace: Mutex::new(None),
        }
    }

    /// Start (or restart) the one-second countdown ticker.
    pub fn start_countdown(&self, state: SharedState) {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick completes immediately; the first
            // decrement belongs one second after the round reset.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match round_engine::handle_countdown_tick(&state).await {
                    Ok(TickFlow::Continue) => {}
                    Ok(TickFlow::Stop) => break,
                    Err(err) => warn!(error = %err, "countdown tick failed; skipping"),
                }
            }
        });
        replace(&self.countdown, handle);
    }

    /// Stop the countdown ticker.
    pub fn stop_countdown(&self) {
        abort(&self.countdown);
    }

    /// Start (or restart) the number-call ticker.
    ///
    /// The immediate first call on phase transition is made by the engine
    /// before this starts, so the ticker begins a full interval later.
    pub fn start_caller(&self, state: SharedState) {
        let call_interval = state.config().call_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(call_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match round_engine::handle_call_tick(&state).await {
                    Ok(TickFlow::Continue) => {}
                    Ok(TickFlow::Stop) => break,
                    Err(err) => warn!(error = %err, "number call tick failed; skipping"),
                }
            }
        });
        replace(&self.caller, handle);
    }

    /// Stop the number-call ticker.
    pub fn stop_caller(&self) {
        abort(&self.caller);
    }

    /// Schedule the reset that follows an ended round.
    ///
    /// Retries until the reset lands: a transient store failure here would
    /// otherwise leave the round in the ended phase forever.
    pub fn start_grace(&self, state: SharedState, delay: Duration) {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            loop {
                match round_engine::handle_grace_elapsed(&state).await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(error = %err, "round reset failed; retrying");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        replace(&self.grace, handle);
    }

    /// Cancel every running timer.
    pub fn stop_all(&self) {
        self.stop_countdown();
        self.stop_caller();
        abort(&self.grace);
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

fn replace(slot: &Mutex<Option<JoinHandle<()>>>, handle: JoinHandle<()>) {
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(previous) = guard.replace(handle) {
        previous.abort();
    }
}

fn abort(slot: &Mutex<Option<JoinHandle<()>>>) {
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = guard.take() {
        handle.abort();
    }
}
