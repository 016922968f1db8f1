/// Runtime round and player structures.
pub mod round;
/// Pure phase-transition table.
pub mod state_machine;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, watch};

use crate::{
    config::AppConfig,
    dao::round_store::CoordStore,
    error::ServiceError,
    services::{auth::AuthVerifier, timer::TimerService},
    state::round::Player,
};

/// Shared handle to the application state.
pub type SharedState = Arc<AppState>;

/// Central application state storing connections, the active store, and timers.
pub struct AppState {
    config: AppConfig,
    auth: Arc<dyn AuthVerifier>,
    store: RwLock<Option<Arc<dyn CoordStore>>>,
    degraded: watch::Sender<bool>,
    players: DashMap<String, Player>,
    round_gate: Mutex<()>,
    timer: TimerService,
    process_id: String,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig, auth: Arc<dyn AuthVerifier>) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            config,
            auth,
            store: RwLock::new(None),
            degraded: degraded_tx,
            players: DashMap::new(),
            round_gate: Mutex::new(()),
            timer: TimerService::new(),
            process_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Verifier for inbound session tokens.
    pub fn auth(&self) -> &Arc<dyn AuthVerifier> {
        &self.auth
    }

    /// Obtain a handle to the current coordination store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn CoordStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// The coordination store, or a degraded-mode error for the command boundary.
    pub async fn require_store(&self) -> Result<Arc<dyn CoordStore>, ServiceError> {
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a coordination store implementation and leave degraded mode.
    pub async fn install_store(&self, store: Arc<dyn CoordStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current store and enter degraded mode.
    pub async fn clear_store(&self) {
        {
            let mut guard = self.store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub async fn is_degraded(&self) -> bool {
        let guard = self.store.read().await;
        guard.is_none()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Registry of joined players keyed by stable identity.
    pub fn players(&self) -> &DashMap<String, Player> {
        &self.players
    }

    /// Gate serializing state-mutating command and tick sequences in-process.
    ///
    /// Cross-process safety comes from the store's atomic operations; this
    /// gate only prevents two local mutation sequences from interleaving
    /// between their store calls.
    pub fn round_gate(&self) -> &Mutex<()> {
        &self.round_gate
    }

    /// Cancellable countdown, number-call, and grace timers.
    pub fn timer(&self) -> &TimerService {
        &self.timer
    }

    /// Stable identifier of this process, used as the advisory lock holder.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Update and broadcast the degraded flag.
    fn update_degraded(&self, value: bool) {
        let _ = self.degraded.send(value);
    }
}
