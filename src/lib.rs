//! # Stowage
//!
//! Reactive, scope-partitioned state for long-lived client applications.
//!
//! State lives in named scopes (one per screen or multi-step flow) so a
//! whole flow can be wiped when it completes. Every layer is built on one
//! core engine:
//!
//! ## Store (core engine)
//!
//! - `Store` - scope -> key -> value map with deferred, coalesced
//!   subscriptions, per-key write serialization, optional persistence,
//!   TTL expiry and bounded undo/redo
//! - `Slot<T>` - typed handle to one entry
//! - Bulk eviction by scope, prefix or predicate
//!
//! ## Layers
//!
//! - `StackFacade` - binds a [`Reducer`] to one entry with serialized
//!   dispatch and a middleware chain
//! - `DemandCache` - load-once-per-screen data keyed by navigation context
//! - `CrossTabListener` - merges writes made by other instances sharing the
//!   same storage
//! - `AtomStore` - flat, non-persisted flags for high-frequency UI state
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), stowage::StoreError> {
//! use stowage::{Store, WriteOptions};
//!
//! let store = Store::in_memory();
//! store.write("signup_flow", "email", "ada@example.com", WriteOptions::default()).await?;
//! assert_eq!(
//!     store.read_snapshot("signup_flow", "email", String::new()),
//!     "ada@example.com"
//! );
//!
//! // Flow finished: drop its transient state.
//! store.clear_scope("signup_flow", true).await;
//! assert!(!store.contains("signup_flow", "email"));
//! # Ok(())
//! # }
//! ```

pub mod atom;
pub mod config;
pub mod demand;
pub mod error;
pub mod key;
pub mod persist;
pub mod runtime;
pub mod stack;
pub mod store;
pub mod sync;

// Re-export main types for convenience
pub use atom::{Atom, AtomStore};
pub use config::{ConfigError, StoreConfig};
pub use demand::{DemandCache, LoaderContext, NavigationContext, Route};
pub use error::{AdapterError, BoxError, StoreError};
pub use key::{EntryKey, KeyCodec};
pub use persist::{FileAdapter, MemoryAdapter, NullAdapter, PersistenceAdapter};
pub use runtime::Subscription;
pub use stack::{Dispatch, Middleware, Reducer, StackFacade, Step, TracingMiddleware};
pub use store::{Slot, Store, StoreBuilder, WeakStore, WriteOptions};
pub use sync::{BroadcastFeed, ChangeFeed, CrossTabListener, StorageChange};
