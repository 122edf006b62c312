//! Persistence adapters.
//!
//! The store mirrors persisted entries through a [`PersistenceAdapter`] as
//! JSON strings under physical keys built by [`KeyCodec`](crate::KeyCodec).

mod adapter;
mod file;

pub use adapter::{MemoryAdapter, NullAdapter, PersistenceAdapter};
pub use file::FileAdapter;
