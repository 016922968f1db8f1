//! In-process coordination backend for single-instance deployments.
//!
//! All round mutations run under one async mutex, which gives the same
//! all-or-nothing guarantees the shared backend provides through
//! compare-and-swap, without any I/O.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::dao::{
    models::{AppendOutcome, CardGrid, ReleaseOutcome, ReserveOutcome, RoundOutcome, RoundRecord},
    round_store::{GuardStore, PresenceStore, RoundStore},
    storage::StorageResult,
};

#[derive(Debug)]
struct GuardEntry {
    response: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct AdvisoryLock {
    holder: String,
    expires_at: Instant,
}

struct MemoryInner {
    round: Mutex<RoundRecord>,
    guard: DashMap<String, GuardEntry>,
    rates: DashMap<String, RateWindow>,
    leases: DashMap<String, Lease>,
    locks: DashMap<String, AdvisoryLock>,
}

/// Coordination store backed by process-local structures.
#[derive(Clone)]
pub struct MemoryCoordStore {
    inner: Arc<MemoryInner>,
}

impl MemoryCoordStore {
    /// Create an empty store; the engine bootstraps it with `begin_round`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                round: Mutex::new(RoundRecord::empty()),
                guard: DashMap::new(),
                rates: DashMap::new(),
                leases: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundStore for MemoryCoordStore {
    fn load_round(&self) -> BoxFuture<'static, StorageResult<RoundRecord>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.round.lock().await.clone()) })
    }

    fn begin_round(
        &self,
        pool: Vec<CardGrid>,
        countdown: u32,
    ) -> BoxFuture<'static, StorageResult<RoundRecord>> {
        let store = self.clone();
        Box::pin(async move {
            let mut round = store.inner.round.lock().await;
            round.begin(pool, countdown);
            Ok(round.clone())
        })
    }

    fn decrement_countdown(&self) -> BoxFuture<'static, StorageResult<u32>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.round.lock().await.decrement_countdown()) })
    }

    fn set_active(&self) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.round.lock().await.activate()) })
    }

    fn append_called(&self, number: u8) -> BoxFuture<'static, StorageResult<AppendOutcome>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.round.lock().await.append_called(number)) })
    }

    fn reserve_slots(
        &self,
        identity: String,
        desired: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<ReserveOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .inner
                .round
                .lock()
                .await
                .try_reserve(&identity, &desired))
        })
    }

    fn release_slots(
        &self,
        identity: String,
        slots: Vec<u8>,
    ) -> BoxFuture<'static, StorageResult<ReleaseOutcome>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.round.lock().await.release(&identity, &slots)) })
    }

    fn release_owner(&self, identity: String) -> BoxFuture<'static, StorageResult<ReleaseOutcome>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.round.lock().await.release_owner(&identity)) })
    }

    fn finish_round(
        &self,
        outcome: RoundOutcome,
        winners_cap: usize,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.round.lock().await.finish(outcome, winners_cap)) })
    }

    fn acquire_lock(
        &self,
        name: String,
        holder: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let now = Instant::now();
            let mut acquired = false;
            let mut entry = store
                .inner
                .locks
                .entry(name)
                .or_insert_with(|| AdvisoryLock {
                    holder: holder.clone(),
                    expires_at: now + ttl,
                });
            if entry.holder == holder || entry.expires_at <= now {
                entry.holder = holder;
                entry.expires_at = now + ttl;
                acquired = true;
            }
            Ok(acquired)
        })
    }

    fn release_lock(
        &self,
        name: String,
        holder: String,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .inner
                .locks
                .remove_if(&name, |_, lock| lock.holder == holder);
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl GuardStore for MemoryCoordStore {
    fn fetch_response(&self, key: String) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let store = self.clone();
        Box::pin(async move {
            let now = Instant::now();
            if let Some(entry) = store.inner.guard.get(&key) {
                if entry.expires_at > now {
                    return Ok(Some(entry.response.clone()));
                }
            }
            store.inner.guard.remove_if(&key, |_, e| e.expires_at <= now);
            Ok(None)
        })
    }

    fn record_response(
        &self,
        key: String,
        response: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.inner.guard.insert(
                key,
                GuardEntry {
                    response,
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(())
        })
    }

    fn bump_rate(&self, key: String, window: Duration) -> BoxFuture<'static, StorageResult<u32>> {
        let store = self.clone();
        Box::pin(async move {
            let now = Instant::now();
            let mut entry = store.inner.rates.entry(key).or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
            });
            if now.duration_since(entry.window_start) > window {
                entry.window_start = now;
                entry.count = 0;
            }
            entry.count += 1;
            Ok(entry.count)
        })
    }
}

impl PresenceStore for MemoryCoordStore {
    fn claim_lease(
        &self,
        identity: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let now = Instant::now();
            let mut claimed = false;
            let mut entry = store.inner.leases.entry(identity).or_insert_with(|| Lease {
                token: token.clone(),
                expires_at: now + ttl,
            });
            if entry.token == token || entry.expires_at <= now {
                entry.token = token;
                entry.expires_at = now + ttl;
                claimed = true;
            }
            Ok(claimed)
        })
    }

    fn refresh_lease(
        &self,
        identity: String,
        token: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let now = Instant::now();
            match store.inner.leases.get_mut(&identity) {
                Some(mut lease) if lease.token == token && lease.expires_at > now => {
                    lease.expires_at = now + ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release_lease(
        &self,
        identity: String,
        token: String,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .inner
                .leases
                .remove_if(&identity, |_, lease| lease.token == token);
            Ok(())
        })
    }

    fn lease_count(&self) -> BoxFuture<'static, StorageResult<usize>> {
        let store = self.clone();
        Box::pin(async move {
            let now = Instant::now();
            store.inner.leases.retain(|_, lease| lease.expires_at > now);
            Ok(store.inner.leases.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::from_secs(30)
    }

    #[tokio::test]
    async fn lease_is_exclusive_but_reclaimable_by_same_token() {
        let store = MemoryCoordStore::new();

        assert!(
            store
                .claim_lease("alice".into(), "conn-1".into(), ttl())
                .await
                .unwrap()
        );
        // A second connection racing for the same identity is refused.
        assert!(
            !store
                .claim_lease("alice".into(), "conn-2".into(), ttl())
                .await
                .unwrap()
        );
        // Re-claim by the holder is idempotent.
        assert!(
            store
                .claim_lease("alice".into(), "conn-1".into(), ttl())
                .await
                .unwrap()
        );

        store
            .release_lease("alice".into(), "conn-1".into())
            .await
            .unwrap();
        assert!(
            store
                .claim_lease("alice".into(), "conn-2".into(), ttl())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let store = MemoryCoordStore::new();
        assert!(
            store
                .claim_lease("alice".into(), "conn-1".into(), Duration::ZERO)
                .await
                .unwrap()
        );
        assert!(
            store
                .claim_lease("alice".into(), "conn-2".into(), ttl())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn refresh_requires_live_matching_lease() {
        let store = MemoryCoordStore::new();
        store
            .claim_lease("alice".into(), "conn-1".into(), ttl())
            .await
            .unwrap();

        assert!(
            store
                .refresh_lease("alice".into(), "conn-1".into(), ttl())
                .await
                .unwrap()
        );
        assert!(
            !store
                .refresh_lease("alice".into(), "conn-2".into(), ttl())
                .await
                .unwrap()
        );
        assert!(
            !store
                .refresh_lease("bob".into(), "conn-1".into(), ttl())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn guard_entries_expire() {
        let store = MemoryCoordStore::new();
        store
            .record_response("alice:markCell:r1".into(), "{\"ok\":true}".into(), ttl())
            .await
            .unwrap();
        assert_eq!(
            store
                .fetch_response("alice:markCell:r1".into())
                .await
                .unwrap()
                .as_deref(),
            Some("{\"ok\":true}")
        );

        store
            .record_response("alice:markCell:r2".into(), "{}".into(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            store
                .fetch_response("alice:markCell:r2".into())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn rate_window_counts_and_resets() {
        let store = MemoryCoordStore::new();
        for expected in 1..=3 {
            let count = store
                .bump_rate("alice:markCell".into(), ttl())
                .await
                .unwrap();
            assert_eq!(count, expected);
        }

        // A zero-width window restarts counting on every bump.
        assert_eq!(
            store
                .bump_rate("bob:markCell".into(), Duration::ZERO)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .bump_rate("bob:markCell".into(), Duration::ZERO)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn advisory_lock_is_exclusive_until_released() {
        let store = MemoryCoordStore::new();
        assert!(
            store
                .acquire_lock("round-timer".into(), "proc-a".into(), ttl())
                .await
                .unwrap()
        );
        assert!(
            !store
                .acquire_lock("round-timer".into(), "proc-b".into(), ttl())
                .await
                .unwrap()
        );
        // Holder re-acquire refreshes the TTL.
        assert!(
            store
                .acquire_lock("round-timer".into(), "proc-a".into(), ttl())
                .await
                .unwrap()
        );

        store
            .release_lock("round-timer".into(), "proc-a".into())
            .await
            .unwrap();
        assert!(
            store
                .acquire_lock("round-timer".into(), "proc-b".into(), ttl())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_reservations_never_double_book() {
        let store = MemoryCoordStore::new();
        store.begin_round(Vec::new(), 10).await.unwrap();

        let mut handles = Vec::new();
        for player in 0..8u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .reserve_slots(format!("player{player}"), vec![1, 2])
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ReserveOutcome::Applied { .. }) {
                winners += 1;
            }
        }

        // Contested slots land with exactly one identity.
        assert_eq!(winners, 1);
        let record = store.load_round().await.unwrap();
        assert_eq!(record.reservations.len(), 2);
        let owners: std::collections::HashSet<_> = record.reservations.values().collect();
        assert_eq!(owners.len(), 1);
    }
}
