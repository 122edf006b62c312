use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;

use super::lock;
use crate::error::StoreError;

pub(crate) type Callback<V> = Arc<dyn Fn(Option<&V>) + Send + Sync>;

struct Registry<K, V> {
    next_id: u64,
    subscribers: HashMap<K, Vec<(u64, Callback<V>)>>,
    // Arrival order of dirty keys; `pending` holds the latest value per key.
    queue: Vec<K>,
    pending: HashMap<K, Option<V>>,
    scheduled: bool,
}

impl<K, V> Registry<K, V> {
    fn new() -> Self {
        Self {
            next_id: 0,
            subscribers: HashMap::new(),
            queue: Vec::new(),
            pending: HashMap::new(),
            scheduled: false,
        }
    }
}

struct NotifierInner<K, V> {
    registry: Mutex<Registry<K, V>>,
    handle: Option<Handle>,
}

/// Subscriber registry with deferred, coalesced delivery.
///
/// Marking a key dirty schedules one flush on the runtime; every mark that
/// lands before the flush runs collapses into a single callback per
/// subscriber carrying the latest value. Without a runtime the flush happens
/// inline.
pub(crate) struct Notifier<K, V> {
    inner: Arc<NotifierInner<K, V>>,
}

impl<K, V> Clone for Notifier<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Notifier<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(handle: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                registry: Mutex::new(Registry::new()),
                handle,
            }),
        }
    }

    /// Register a callback and return its id.
    pub(crate) fn subscribe(&self, key: K, callback: Callback<V>) -> u64 {
        let mut registry = lock(&self.inner.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .subscribers
            .entry(key)
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove a callback. Returns whether it was registered.
    pub(crate) fn unsubscribe(&self, key: &K, id: u64) -> bool {
        let mut registry = lock(&self.inner.registry);
        let Some(list) = registry.subscribers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.subscribers.remove(key);
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, key: &K) -> usize {
        lock(&self.inner.registry)
            .subscribers
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Queue a notification for `key` carrying `value`.
    pub(crate) fn mark(&self, key: K, value: Option<V>) {
        if self.enqueue(key, value) {
            self.flush();
        }
    }

    /// Queue without flushing. Returns true when the caller must call
    /// [`Notifier::flush`] itself, once it has released its own locks.
    pub(crate) fn enqueue(&self, key: K, value: Option<V>) -> bool {
        let mut registry = lock(&self.inner.registry);
        if !registry.subscribers.contains_key(&key) {
            return false;
        }
        if registry.pending.insert(key.clone(), value).is_none() {
            registry.queue.push(key);
        }
        if registry.scheduled {
            return false;
        }
        let Some(handle) = &self.inner.handle else {
            return true;
        };
        registry.scheduled = true;
        let weak: Weak<NotifierInner<K, V>> = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(inner) = weak.upgrade() {
                Notifier { inner }.flush();
            }
        });
        false
    }

    /// Deliver everything queued so far.
    pub(crate) fn flush(&self) {
        let batch = {
            let mut registry = lock(&self.inner.registry);
            registry.scheduled = false;
            let queue = std::mem::take(&mut registry.queue);
            let mut pending = std::mem::take(&mut registry.pending);
            queue
                .into_iter()
                .filter_map(|key| {
                    let value = pending.remove(&key)?;
                    let callbacks: Vec<Callback<V>> = registry
                        .subscribers
                        .get(&key)?
                        .iter()
                        .map(|(_, callback)| Arc::clone(callback))
                        .collect();
                    Some((key, value, callbacks))
                })
                .collect::<Vec<_>>()
        };

        for (key, value, callbacks) in batch {
            for callback in callbacks {
                let result = catch_unwind(AssertUnwindSafe(|| callback(value.as_ref())));
                if let Err(payload) = result {
                    let error = StoreError::Subscriber {
                        key: key.to_string(),
                        message: panic_message(payload.as_ref()),
                    };
                    tracing::error!(%key, %error, "subscriber panicked during notification");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
