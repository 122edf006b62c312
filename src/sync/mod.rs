//! Cross-instance synchronization.
//!
//! Instances of an application on one device share persistent storage.
//! Each store announces its persisted writes on a [`ChangeFeed`]; a
//! [`CrossTabListener`] on every other instance merges them back in memory.

mod feed;
mod listener;

pub use feed::{BroadcastFeed, ChangeFeed, StorageChange};
pub use listener::CrossTabListener;
