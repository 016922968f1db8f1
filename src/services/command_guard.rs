//! Replay protection and rate limiting for inbound commands.
//!
//! A command that carries a request id is answered from the guard store when
//! the same `(actor, action, request id)` was already handled inside the TTL,
//! so network retries of non-idempotent commands are never double-applied.
//! Replays are served before rate accounting: resending a lost ack is not an
//! abusive action.

use std::future::Future;

use tracing::warn;

use crate::{dto::ws::Ack, error::ServiceError, state::SharedState};

/// Compose the idempotency key for one command.
fn response_key(actor: &str, action: &str, request_id: &str) -> String {
    format!("{actor}:{action}:{request_id}")
}

/// Compose the rate-window key for one actor and action.
fn rate_key(actor: &str, action: &str) -> String {
    format!("{actor}:{action}")
}

/// Run `compute` under replay and rate protection, returning the ack to send.
///
/// The recorded response is replayed byte-identically; `compute` only runs
/// for requests that are neither replays nor rate-limited, and its ack
/// (success or error) is what gets recorded for future replays.
pub async fn run_guarded<F, Fut>(
    state: &SharedState,
    actor: &str,
    action: &str,
    request_id: Option<&str>,
    compute: F,
) -> Ack
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Ack>,
{
    let store = match state.require_store().await {
        Ok(store) => store,
        Err(err) => return Ack::error(request_id.map(Into::into), &err),
    };

    if let Some(id) = request_id {
        let key = response_key(actor, action, id);
        match store.fetch_response(key).await {
            Ok(Some(recorded)) => match serde_json::from_str::<Ack>(&recorded) {
                Ok(ack) => return ack,
                Err(err) => {
                    warn!(actor, action, error = %err, "discarding unreadable recorded response");
                }
            },
            Ok(None) => {}
            Err(err) => {
                return Ack::error(request_id.map(Into::into), &ServiceError::from(err));
            }
        }
    }

    match store
        .bump_rate(rate_key(actor, action), state.config().rate_window())
        .await
    {
        Ok(count) if count > state.config().rate_max => {
            return Ack::error(request_id.map(Into::into), &ServiceError::RateLimited);
        }
        Ok(_) => {}
        Err(err) => {
            return Ack::error(request_id.map(Into::into), &ServiceError::from(err));
        }
    }

    let ack = compute().await;

    if let Some(id) = request_id {
        match serde_json::to_string(&ack) {
            Ok(encoded) => {
                let key = response_key(actor, action, id);
                if let Err(err) = store
                    .record_response(key, encoded, state.config().guard_ttl())
                    .await
                {
                    warn!(actor, action, error = %err, "failed to record command response");
                }
            }
            Err(err) => {
                warn!(actor, action, error = %err, "failed to encode command response");
            }
        }
    }

    ack
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::{
        config::AppConfig, dao::round_store::memory::MemoryCoordStore,
        services::auth::DevTokenVerifier, state::AppState,
    };

    async fn test_state(config: AppConfig) -> SharedState {
        let state = AppState::new(config, Arc::new(DevTokenVerifier));
        state
            .install_store(Arc::new(MemoryCoordStore::new()))
            .await;
        state
    }

    #[tokio::test]
    async fn replayed_request_id_returns_recorded_ack_without_recompute() {
        let state = test_state(AppConfig::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let ack = run_guarded(&state, "alice", "markCell", Some("r-1"), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ack::ok(Some("r-1".into()), None)
            })
            .await;
            assert!(ack.ok);
            assert_eq!(ack.request_id.as_deref(), Some("r-1"));
        }

        // One underlying mutation, three identical acks.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_acks_are_replayed_too() {
        let state = test_state(AppConfig::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let ack = run_guarded(&state, "alice", "claimBingo", Some("r-2"), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ack::error(
                    Some("r-2".into()),
                    &ServiceError::InvalidState("no winning card yet".into()),
                )
            })
            .await;
            assert!(!ack.ok);
            assert_eq!(ack.code, "INVALID_STATE");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commands_without_request_id_always_recompute() {
        let state = test_state(AppConfig::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            run_guarded(&state, "alice", "syncState", None, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ack::ok(None, None)
            })
            .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limit_trips_beyond_max_count() {
        let config = AppConfig {
            rate_max: 3,
            ..AppConfig::default()
        };
        let state = test_state(config).await;

        for attempt in 1..=5u32 {
            let ack = run_guarded(&state, "alice", "markCell", None, || async {
                Ack::ok(None, None)
            })
            .await;
            if attempt <= 3 {
                assert!(ack.ok, "attempt {attempt} should pass");
            } else {
                assert!(!ack.ok, "attempt {attempt} should be limited");
                assert_eq!(ack.code, "RATE_LIMITED");
            }
        }

        // Other actors and actions are unaffected.
        let ack = run_guarded(&state, "bob", "markCell", None, || async {
            Ack::ok(None, None)
        })
        .await;
        assert!(ack.ok);
    }
}
