use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::lock;

/// Per-key FIFO tokens serializing every read-modify-write on one key.
///
/// A caller arriving while the token is held queues behind it, so operations
/// on one key complete in arrival order. Idle tokens are dropped from the map
/// once their last holder releases them.
pub(crate) struct PendingTokens<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> PendingTokens<K> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for and take the token for `key`.
    pub(crate) async fn acquire(&self, key: &K) -> PendingGuard<'_, K> {
        let slot = {
            let mut slots = lock(&self.slots);
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        PendingGuard {
            guard: Some(guard),
            slot,
            key: key.clone(),
            tokens: self,
        }
    }

    /// Whether any caller holds or awaits the token for `key`.
    #[cfg(test)]
    pub(crate) fn is_busy(&self, key: &K) -> bool {
        lock(&self.slots).contains_key(key)
    }
}

/// Holds a key's token until dropped.
pub(crate) struct PendingGuard<'a, K: Eq + Hash + Clone> {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<AsyncMutex<()>>,
    key: K,
    tokens: &'a PendingTokens<K>,
}

impl<K: Eq + Hash + Clone> Drop for PendingGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = lock(&self.tokens.slots);
        // One reference in the map, one here: nobody else is queued.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_in_arrival_order() {
        let tokens = Arc::new(PendingTokens::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = tokens.acquire(&"k").await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let tokens = Arc::clone(&tokens);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = tokens.acquire(&"k").await;
                order.lock().unwrap().push(i);
            }));
            // Let each task reach the queue before spawning the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(!tokens.is_busy(&"k"));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let tokens = PendingTokens::new();
        let _a = tokens.acquire(&"a").await;
        let _b = tokens.acquire(&"b").await;
        assert!(tokens.is_busy(&"a"));
        assert!(tokens.is_busy(&"b"));
    }
}
