/// In-process backend for single-instance deployments.
pub mod memory;
#[cfg(feature = "mongo-store")]
/// Shared MongoDB backend for multi-instance deployments.
pub mod mongodb;

use std::time::Duration;

use futures::future::BoxFuture;

use crate::dao::{
    models::{AppendOutcome, CardGrid, ReleaseOutcome, ReserveOutcome, RoundOutcome, RoundRecord},
    storage::StorageResult,
};

/// Abstraction over the authoritative round state.
///
/// Every method is an atomic unit: callers never compose a read with a
/// dependent write outside the store, so backends are free to implement
/// atomicity with a local mutex or an optimistic compare-and-swap loop.
pub trait RoundStore: Send + Sync {
    /// Read the current round record.
    fn load_round(&self) -> BoxFuture<'static, StorageResult<RoundRecord>>;
    /// Atomically reset the round for a new countdown with a fresh card pool.
    fn begin_round(
        &self,
        pool: Vec<CardGrid>,
        countdown: u32,
    ) -> BoxFuture<'static, StorageResult<RoundRecord>>;
    /// Atomically decrement the countdown, clamping at zero; returns the new value.
    fn decrement_countdown(&self) -> BoxFuture<'static, StorageResult<u32>>;
    /// Transition countdown to active; false when the round is not counting down.
    fn set_active(&self) -> BoxFuture<'static, StorageResult<bool>>;
    /// Append a called number unless it is already present.
    fn append_called(&self, number: u8) -> BoxFuture<'static, StorageResult<AppendOutcome>>;
    /// Atomically swap `identity`'s reservation to `desired`.
    fn reserve_slots(
        &self,
        identity: String,
        desired: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<ReserveOutcome>>;
    /// Release the subset of `slots` held by `identity`.
    fn release_slots(
        &self,
        identity: String,
        slots: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<ReleaseOutcome>>;
    /// Release every slot held by `identity`.
    fn release_owner(&self, identity: String) -> BoxFuture<'static, StorageResult<ReleaseOutcome>>;
    /// Transition active to ended with `outcome`; false if the round already ended.
    fn finish_round(
        &self,
        outcome: RoundOutcome,
        winners_cap: usize,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Acquire (or re-acquire as the same holder) a named advisory lock.
    fn acquire_lock(
        &self,
        name: String,
        holder: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Release a named advisory lock if `holder` owns it.
    fn release_lock(&self, name: String, holder: String)
    -> BoxFuture<'static, StorageResult<()>>;
    /// Verify the backend is reachable.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the backend connection after a health check failure.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Idempotency records and rate-limit windows for the command guard.
pub trait GuardStore: Send + Sync {
    /// Fetch the recorded response for an idempotency key, if still live.
    fn fetch_response(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>>;
    /// Record a response for an idempotency key with a time-to-live.
    fn record_response(
        &self,
        key: String,
        response: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Count one more action inside the current rate window; returns the new count.
    fn bump_rate(&self, key: String, window: Duration) -> BoxFuture<'static, StorageResult<u32>>;
}

/// Presence leases tying one live connection to each identity.
pub trait PresenceStore: Send + Sync {
    /// Claim the lease for `identity`; idempotent for the same `token`.
    fn claim_lease(
        &self,
        identity: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Extend a live lease; false if the lease expired or belongs to another token.
    fn refresh_lease(
        &self,
        identity: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Drop the lease if `token` owns it.
    fn release_lease(
        &self,
        identity: String,
        token: String,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Number of currently live leases.
    fn lease_count(&self) -> BoxFuture<'static, StorageResult<usize>>;
}

/// Full coordination backend: round state, command guard, and presence.
///
/// The round engine only ever sees this trait object; it must never branch on
/// which backend is active.
pub trait CoordStore: RoundStore + GuardStore + PresenceStore {}

impl<T> CoordStore for T where T: RoundStore + GuardStore + PresenceStore {}
