use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Store, WriteOptions};
use crate::error::StoreError;
use crate::key::EntryKey;
use crate::runtime::Subscription;

/// Typed handle to one entry of a [`Store`].
///
/// Binds the value type and default at the call site so every access
/// through the handle agrees on the shape.
#[derive(Clone)]
pub struct Slot<T> {
    store: Store,
    entry: EntryKey,
    default: T,
    options: WriteOptions,
}

impl<T> Slot<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub(crate) fn new(store: Store, entry: EntryKey, default: T) -> Self {
        Self {
            store,
            entry,
            default,
            options: WriteOptions::default(),
        }
    }

    /// Use these options for writes through this handle.
    #[must_use]
    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// The entry address.
    pub fn entry(&self) -> &EntryKey {
        &self.entry
    }

    /// Current in-memory value.
    pub fn get(&self) -> T {
        self.store.typed_snapshot(&self.entry, self.default.clone())
    }

    /// Current value, hydrating first when writes through this handle persist.
    pub async fn load(&self) -> T {
        self.store
            .read_async(
                self.entry.scope(),
                self.entry.key(),
                self.default.clone(),
                self.options.persist,
            )
            .await
    }

    /// Write a new value.
    pub async fn set(&self, value: T) -> Result<T, StoreError> {
        self.store
            .write(self.entry.scope(), self.entry.key(), value, self.options)
            .await
    }

    /// Transform the current value.
    pub async fn update(&self, f: impl FnOnce(T) -> T) -> Result<T, StoreError> {
        self.store
            .replace_entry(&self.entry, self.default.clone(), self.options, f)
            .await
    }

    /// Call `callback` with the typed value after writes settle.
    ///
    /// Removed or mis-shaped values are delivered as the default.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        T: Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let default = self.default.clone();
        let entry = self.entry.clone();
        self.store
            .subscribe(self.entry.scope(), self.entry.key(), move |value| {
                let typed = value
                    .and_then(|value| match serde_json::from_value(value.clone()) {
                        Ok(typed) => Some(typed),
                        Err(err) => {
                            tracing::warn!(%entry, error = %err, "subscriber skipped mis-shaped value");
                            None
                        }
                    })
                    .unwrap_or_else(|| default.clone());
                callback(typed);
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn typed_round_trip() {
        let store = Store::in_memory();
        let items = store.slot("cart", "items", Vec::<String>::new());

        items.set(vec!["apple".into()]).await.unwrap();
        let updated = items
            .update(|mut list| {
                list.push("pear".into());
                list
            })
            .await
            .unwrap();

        assert_eq!(updated, vec!["apple", "pear"]);
        assert_eq!(items.get(), vec!["apple", "pear"]);
        assert_eq!(store.history_len("cart", "items"), (2, 0));
    }

    #[tokio::test]
    async fn subscribe_receives_typed_values() {
        let store = Store::in_memory();
        let count = store.slot("s", "count", 0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = count.subscribe(move |value| seen_clone.lock().unwrap().push(value));

        count.set(4).await.unwrap();
        store.flush_notifications();
        store.clear_key("s", "count", false).await;
        store.flush_notifications();

        assert_eq!(*seen.lock().unwrap(), vec![4, 0]);
    }
}
