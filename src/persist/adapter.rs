use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::runtime::lock;

/// Async string key/value storage that mirrors persisted entries.
///
/// The store assumes only per-key atomicity from implementations. Used as
/// `Arc<dyn PersistenceAdapter>`.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Read the raw value at `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<String>, AdapterError>;

    /// Store `value` at `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), AdapterError>;

    /// Delete `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), AdapterError>;

    /// Every key currently stored.
    async fn keys(&self) -> Result<Vec<String>, AdapterError>;
}

/// Adapter that persists nothing. The default for stores built without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAdapter;

#[async_trait]
impl PersistenceAdapter for NullAdapter {
    async fn get(&self, _key: &str) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, AdapterError> {
        Ok(Vec::new())
    }
}

/// In-memory adapter standing in for device storage.
///
/// Clones share the same map, so two stores built on clones of one adapter
/// behave like two instances of an application on one device. Failures can
/// be injected to exercise degraded paths.
#[derive(Debug, Default, Clone)]
pub struct MemoryAdapter {
    data: Arc<Mutex<BTreeMap<String, String>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw value at `key`, bypassing failure injection.
    pub fn raw(&self, key: &str) -> Option<String> {
        lock(&self.data).get(key).cloned()
    }

    /// Put a raw value, bypassing failure injection.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.data).insert(key.into(), value.into());
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        lock(&self.data).is_empty()
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn get(&self, key: &str) -> Result<Option<String>, AdapterError> {
        self.check()?;
        Ok(lock(&self.data).get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        self.check()?;
        lock(&self.data).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AdapterError> {
        self.check()?;
        lock(&self.data).remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, AdapterError> {
        self.check()?;
        Ok(lock(&self.data).keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_adapter_basic_ops() {
        let adapter = MemoryAdapter::new();
        assert_eq!(adapter.get("a").await.unwrap(), None);

        adapter.set("a", "1").await.unwrap();
        adapter.set("b", "2").await.unwrap();
        assert_eq!(adapter.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(adapter.keys().await.unwrap(), vec!["a", "b"]);

        adapter.remove("a").await.unwrap();
        adapter.remove("missing").await.unwrap();
        assert_eq!(adapter.len(), 1);
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let adapter = MemoryAdapter::new();
        let other = adapter.clone();
        adapter.set("k", "v").await.unwrap();
        assert_eq!(other.raw("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn injected_failures() {
        let adapter = MemoryAdapter::new();
        adapter.set_failing(true);
        assert!(matches!(
            adapter.set("k", "v").await,
            Err(AdapterError::Unavailable(_))
        ));
        adapter.set_failing(false);
        adapter.set("k", "v").await.unwrap();
    }
}
