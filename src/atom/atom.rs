use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

use crate::runtime::{lock, Notifier, Subscription};

/// Type-erased atom value.
pub type AtomValue = Arc<dyn Any + Send + Sync>;

struct AtomInner {
    values: Mutex<HashMap<String, AtomValue>>,
    notifier: Notifier<String, AtomValue>,
}

/// Flat map of ephemeral flags.
///
/// No persistence, no history and no TTL. Writes serialize on one lock and
/// subscribers are notified through the same deferred, coalesced path as the
/// [`Store`](crate::Store), so a burst of writes (drag state, hover flags)
/// reaches each subscriber once with the final value.
///
/// # Examples
///
/// ```
/// use stowage::AtomStore;
///
/// let atoms = AtomStore::new();
/// let overlay = atoms.atom("overlay_open", false);
///
/// overlay.set(true);
/// assert!(overlay.get());
/// assert_eq!(atoms.get::<bool>("overlay_open"), Some(true));
/// ```
#[derive(Clone)]
pub struct AtomStore {
    inner: Arc<AtomInner>,
}

impl Default for AtomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomStore")
            .field("len", &self.len())
            .finish()
    }
}

impl AtomStore {
    /// Create an empty store on the ambient tokio runtime, if any.
    pub fn new() -> Self {
        Self::build(Handle::try_current().ok())
    }

    /// Create an empty store that schedules notifications on `handle`.
    pub fn with_runtime(handle: Handle) -> Self {
        Self::build(Some(handle))
    }

    fn build(handle: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(AtomInner {
                values: Mutex::new(HashMap::new()),
                notifier: Notifier::new(handle),
            }),
        }
    }

    /// Typed handle to `key`, reading as `default` while unset.
    pub fn atom<T>(&self, key: impl Into<String>, default: T) -> Atom<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        Atom {
            store: self.clone(),
            key: key.into(),
            default,
        }
    }

    /// Current value, if set and of type `T`.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let value = lock(&self.inner.values).get(key).cloned()?;
        value.downcast_ref::<T>().cloned()
    }

    /// Raw value regardless of type.
    pub fn get_value(&self, key: &str) -> Option<AtomValue> {
        lock(&self.inner.values).get(key).cloned()
    }

    /// Whether `key` is set.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner.values).contains_key(key)
    }

    /// Set keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.inner.values).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of set keys.
    pub fn len(&self) -> usize {
        lock(&self.inner.values).len()
    }

    /// Whether no key is set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the value of `key`.
    pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        let value: AtomValue = Arc::new(value);
        self.commit(key, |values| {
            values.insert(key.to_owned(), Arc::clone(&value));
            (Some(value), ())
        });
    }

    /// Transform the current value (or `default`) and return the result.
    ///
    /// A value of another type is treated as unset.
    pub fn update<T, F>(&self, key: &str, default: T, f: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> T,
    {
        self.commit(key, |values| {
            let current = values
                .get(key)
                .and_then(|value| value.downcast_ref::<T>().cloned())
                .unwrap_or(default);
            let next = f(current);
            let stored: AtomValue = Arc::new(next.clone());
            values.insert(key.to_owned(), Arc::clone(&stored));
            (Some(stored), next)
        })
    }

    /// Unset `key`. Returns whether it was set.
    pub fn remove(&self, key: &str) -> bool {
        self.commit(key, |values| (None, values.remove(key).is_some()))
    }

    /// Unset every key.
    pub fn clear(&self) -> usize {
        let (cleared, flush) = {
            let mut values = lock(&self.inner.values);
            let keys: Vec<String> = values.drain().map(|(key, _)| key).collect();
            let mut flush = false;
            for key in &keys {
                flush |= self.inner.notifier.enqueue(key.clone(), None);
            }
            (keys.len(), flush)
        };
        if flush {
            self.inner.notifier.flush();
        }
        cleared
    }

    /// Call `callback` with the latest value of `key` after writes settle.
    ///
    /// The callback receives `None` once the key is removed. Values of
    /// another type are skipped with a warning.
    pub fn subscribe<T, F>(&self, key: &str, callback: F) -> Subscription
    where
        T: Clone + 'static,
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let owned = key.to_owned();
        let id = self.inner.notifier.subscribe(
            owned.clone(),
            Arc::new(move |value: Option<&AtomValue>| match value {
                None => callback(None),
                Some(value) => match value.downcast_ref::<T>() {
                    Some(typed) => callback(Some(typed.clone())),
                    None => tracing::warn!(key = %owned, "atom subscriber skipped value of another type"),
                },
            }),
        );

        let notifier = self.inner.notifier.clone();
        let key = key.to_owned();
        Subscription::new(move || {
            notifier.unsubscribe(&key, id);
        })
    }

    /// Deliver queued notifications now.
    pub fn flush_notifications(&self) {
        self.inner.notifier.flush();
    }

    /// Mutate under the lock and queue the notification before releasing
    /// it, so queued values follow write order. Flushes after release.
    fn commit<R>(
        &self,
        key: &str,
        mutate: impl FnOnce(&mut HashMap<String, AtomValue>) -> (Option<AtomValue>, R),
    ) -> R {
        let (flush, result) = {
            let mut values = lock(&self.inner.values);
            let (after, result) = mutate(&mut values);
            (self.inner.notifier.enqueue(key.to_owned(), after), result)
        };
        if flush {
            self.inner.notifier.flush();
        }
        result
    }
}

/// Typed handle to one atom.
#[derive(Clone)]
pub struct Atom<T> {
    store: AtomStore,
    key: String,
    default: T,
}

impl<T> Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The atom's key in its store.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value, or the default while unset.
    pub fn get(&self) -> T {
        self.store
            .get(&self.key)
            .unwrap_or_else(|| self.default.clone())
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.store.set(&self.key, value);
    }

    /// Transform the current value and return the result.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        self.store.update(&self.key, self.default.clone(), f)
    }

    /// Unset, so reads fall back to the default.
    pub fn reset(&self) -> bool {
        self.store.remove(&self.key)
    }

    /// Call `callback` with the value (or default) after writes settle.
    pub fn watch<F>(&self, callback: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let default = self.default.clone();
        self.store
            .subscribe(&self.key, move |value: Option<T>| {
                callback(value.unwrap_or_else(|| default.clone()));
            })
    }

    /// Derived read-only view.
    pub fn map<U, F>(&self, f: F) -> AtomView<T, U, F>
    where
        F: Fn(&T) -> U,
    {
        AtomView {
            atom: self.clone(),
            f,
            _output: PhantomData,
        }
    }
}

/// Read-only projection of an [`Atom`].
pub struct AtomView<T, U, F> {
    atom: Atom<T>,
    f: F,
    _output: PhantomData<fn() -> U>,
}

impl<T, U, F> AtomView<T, U, F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) -> U,
{
    /// Project the atom's current value.
    pub fn get(&self) -> U {
        (self.f)(&self.atom.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_get_and_type_mismatch() {
        let atoms = AtomStore::new();
        atoms.set("drag", (10, 20));

        assert_eq!(atoms.get::<(i32, i32)>("drag"), Some((10, 20)));
        assert_eq!(atoms.get::<bool>("drag"), None);
        assert!(atoms.contains("drag"));
        assert_eq!(atoms.keys(), vec!["drag"]);
    }

    #[test]
    fn update_treats_other_types_as_unset() {
        let atoms = AtomStore::new();
        atoms.set("n", "text");
        assert_eq!(atoms.update("n", 1u32, |n| n + 1), 2);
        assert_eq!(atoms.update("n", 1u32, |n| n + 1), 3);
    }

    #[test]
    fn remove_and_clear() {
        let atoms = AtomStore::new();
        atoms.set("a", 1);
        atoms.set("b", 2);

        assert!(atoms.remove("a"));
        assert!(!atoms.remove("a"));
        assert_eq!(atoms.clear(), 1);
        assert!(atoms.is_empty());
    }

    #[test]
    fn notifies_inline_without_runtime() {
        let atoms = AtomStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = atoms.subscribe("open", move |value: Option<bool>| {
            seen_clone.lock().unwrap().push(value);
        });

        atoms.set("open", true);
        atoms.remove("open");
        assert_eq!(*seen.lock().unwrap(), vec![Some(true), None]);
    }

    #[tokio::test]
    async fn high_frequency_writes_coalesce() {
        let atoms = AtomStore::new();
        let drag = atoms.atom("drag_x", 0i32);
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(0));
        let (calls_clone, last_clone) = (Arc::clone(&calls), Arc::clone(&last));
        let _sub = drag.watch(move |x| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            *last_clone.lock().unwrap() = x;
        });

        for x in 0..1_000 {
            drag.set(x);
        }
        tokio::task::yield_now().await;
        atoms.flush_notifications();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock().unwrap(), 999);
    }

    #[test]
    fn subscriber_may_read_atoms_during_inline_flush() {
        let atoms = AtomStore::new();
        let reader = atoms.clone();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let _sub = atoms.subscribe("a", move |_: Option<i32>| {
            *seen_clone.lock().unwrap() = reader.get::<i32>("a");
        });

        atoms.set("a", 7);
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn typed_handle_and_view() {
        let atoms = AtomStore::new();
        let count = atoms.atom("count", 0u32);
        let doubled = count.map(|n| n * 2);

        count.update(|n| n + 3);
        assert_eq!(count.get(), 3);
        assert_eq!(doubled.get(), 6);

        assert!(count.reset());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let atoms = AtomStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let sub = atoms.subscribe("k", move |_: Option<u8>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        atoms.set("k", 1u8);
        drop(sub);
        atoms.set("k", 2u8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
