use axum::Router;

use crate::state::SharedState;

/// OpenAPI documentation routes.
pub mod docs;
/// Health check routes.
pub mod health;
/// Game WebSocket routes.
pub mod websocket;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router().merge(websocket::router());
    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
