//! Persistence Layer
//!
//! Versioned compare-and-set store for positions, allocations and the kill
//! switch. The file-backed store is the source of truth across restarts.

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileStateStore;
pub use memory::{MemoryStateStore, StoreSnapshot};
pub use store::{update_allocation, update_position, upsert_position, StateStore, Versioned};
