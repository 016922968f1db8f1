//! Presence leases: one live connection per verified identity.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::{error::ServiceError, state::SharedState};

/// Claim the slot for `identity` on behalf of one connection.
///
/// Succeeds when no live lease exists or the live lease already belongs to
/// this connection (idempotent re-claim); a different live connection keeps
/// the slot and the claim is rejected.
pub async fn claim(
    state: &SharedState,
    identity: &str,
    connection_token: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    let claimed = store
        .claim_lease(
            identity.to_string(),
            connection_token.to_string(),
            state.config().lease_ttl(),
        )
        .await?;
    if claimed {
        Ok(())
    } else {
        Err(ServiceError::InvalidState(
            "identity already connected from another session".into(),
        ))
    }
}

/// Extend the lease; false means it expired or was taken over.
pub async fn refresh(
    state: &SharedState,
    identity: &str,
    connection_token: &str,
) -> Result<bool, ServiceError> {
    let store = state.require_store().await?;
    Ok(store
        .refresh_lease(
            identity.to_string(),
            connection_token.to_string(),
            state.config().lease_ttl(),
        )
        .await?)
}

/// Drop the lease on disconnect if this connection still holds it.
pub async fn release(
    state: &SharedState,
    identity: &str,
    connection_token: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    store
        .release_lease(identity.to_string(), connection_token.to_string())
        .await?;
    Ok(())
}

/// Number of identities currently holding a live lease.
pub async fn live_count(state: &SharedState) -> Result<usize, ServiceError> {
    let store = state.require_store().await?;
    Ok(store.lease_count().await?)
}

/// Background renewal for one connection's lease.
///
/// Stops on its own when the lease is lost; the socket handler aborts it on
/// disconnect.
pub fn spawn_refresh_task(
    state: SharedState,
    identity: String,
    connection_token: String,
) -> JoinHandle<()> {
    let period = state
        .config()
        .lease_ttl()
        .checked_div(3)
        .filter(|period| !period.is_zero())
        .unwrap_or(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match refresh(&state, &identity, &connection_token).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(identity, "presence lease lost; stopping renewal");
                    break;
                }
                Err(err) => {
                    warn!(identity, error = %err, "presence lease refresh failed");
                }
            }
        }
    })
}
