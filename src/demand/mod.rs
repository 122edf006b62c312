//! Load-once-per-screen data over the core store.
//!
//! A [`DemandCache`] partitions the [`Store`](crate::Store) by navigation
//! context and remembers which keys have been loaded, so several consumers
//! of one screen trigger a single fetch.

mod cache;
mod context;

pub use cache::{DemandCache, LoaderContext};
pub use context::{route_scope, NavigationContext, Route};
