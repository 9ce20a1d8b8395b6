//! File-backed stores: the price-level definitions and the engine's own state.

pub mod levels;
pub mod persist;

pub use levels::LevelStore;
pub use persist::{PersistedState, StateStore};
