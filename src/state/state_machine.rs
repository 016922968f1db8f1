use thiserror::Error;

use crate::dao::models::RoundPhase;

/// Events that drive the round through its phase cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEvent {
    /// The countdown reached zero.
    CountdownFinished,
    /// A verified winning claim or mark ended the round.
    WinnerDeclared,
    /// The configured number of calls was made without a winner.
    CallBudgetExhausted,
    /// The post-round grace delay elapsed.
    GraceElapsed,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the round was in when the invalid event was received.
    pub from: RoundPhase,
    /// The event that cannot be applied from this phase.
    pub event: RoundEvent,
}

/// Compute the phase that follows `event` from `from`.
///
/// The round cycles forever: countdown, active, ended, countdown again. The
/// store remains the source of truth for the *current* phase; this table only
/// validates that a transition the engine is about to perform is legal.
pub fn next_phase(from: RoundPhase, event: RoundEvent) -> Result<RoundPhase, InvalidTransition> {
    match (from, event) {
        (RoundPhase::Countdown, RoundEvent::CountdownFinished) => Ok(RoundPhase::Active),
        (RoundPhase::Active, RoundEvent::WinnerDeclared | RoundEvent::CallBudgetExhausted) => {
            Ok(RoundPhase::Ended)
        }
        (RoundPhase::Ended, RoundEvent::GraceElapsed) => Ok(RoundPhase::Countdown),
        (from, event) => Err(InvalidTransition { from, event }),
    }
}
