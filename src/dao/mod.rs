/// Storage entity definitions for round coordination state.
pub mod models;
/// Round, guard, and presence storage backends.
pub mod round_store;
/// Storage abstraction layer shared by every backend.
pub mod storage;
