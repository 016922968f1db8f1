//! Keeps the shared store connected, toggling degraded mode while it is not.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    dao::{round_store::CoordStore, storage::StorageError},
    services::round_engine,
    state::SharedState,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Connect to the storage backend, bootstrap the round engine, and keep the
/// connection healthy; the application stays up in degraded mode whenever the
/// backend is unreachable.
pub async fn run<F, Fut>(state: SharedState, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn CoordStore>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        let store = match connect().await {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %err, "storage connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
                continue;
            }
        };

        state.install_store(store.clone()).await;
        info!("storage connection established; leaving degraded mode");
        delay = INITIAL_DELAY;

        if let Err(err) = round_engine::bootstrap(&state).await {
            // A failed bootstrap leaves no timer running; drop the store and
            // start over rather than serving a frozen round.
            error!(error = %err, "round bootstrap failed; retrying connection");
            state.clear_store().await;
            sleep(delay).await;
            continue;
        }

        // Poll health until the connection is lost for good.
        loop {
            match store.health_check().await {
                Ok(()) => sleep(HEALTH_POLL_INTERVAL).await,
                Err(err) => {
                    warn!(error = %err, "storage health check failed; trying to reconnect");
                    match store.try_reconnect().await {
                        Ok(()) => {
                            info!("storage reconnection succeeded");
                        }
                        Err(reconnect_err) => {
                            warn!(error = %reconnect_err, "storage reconnect failed; entering degraded mode");
                            state.clear_store().await;
                            state.timer().stop_all();
                            break;
                        }
                    }
                }
            }
        }

        sleep(delay).await;
    }
}
