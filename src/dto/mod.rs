/// Round and player snapshots shared by several outbound events.
pub mod common;
/// Health check payloads.
pub mod health;
/// Validation helpers for inbound payloads.
pub mod validation;
/// WebSocket message envelopes.
pub mod ws;
