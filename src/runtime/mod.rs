//! Runtime support shared by the stores.
//!
//! This module provides subscriber bookkeeping with deferred delivery,
//! per-key operation serialization, and the RAII subscription guard.

mod notifier;
mod pending;
mod subscription;

pub(crate) use notifier::Notifier;
pub(crate) use pending::{PendingGuard, PendingTokens};
pub use subscription::Subscription;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
