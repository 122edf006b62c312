//! The core scoped store.
//!
//! Stores hold scope -> key -> value state with subscriptions, persistence,
//! TTL expiry and bounded undo/redo.

mod history;
mod options;
mod slot;
mod store;
mod ttl;

pub use options::WriteOptions;
pub use slot::Slot;
pub use store::{Store, StoreBuilder, WeakStore};
