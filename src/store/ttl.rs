use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::AbortHandle;

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

/// TTL durations and the live expiry timer for each key.
///
/// Each armed timer carries a generation; an expiry only applies if its
/// generation is still the registered one.
pub(crate) struct TtlTable<K> {
    durations: HashMap<K, Duration>,
    timers: HashMap<K, Timer>,
    next_generation: u64,
}

impl<K> Default for TtlTable<K> {
    fn default() -> Self {
        Self {
            durations: HashMap::new(),
            timers: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<K: Eq + Hash + Clone> TtlTable<K> {
    pub(crate) fn duration(&self, key: &K) -> Option<Duration> {
        self.durations.get(key).copied()
    }

    pub(crate) fn set_duration(&mut self, key: K, duration: Duration) {
        self.durations.insert(key, duration);
    }

    pub(crate) fn remove_duration(&mut self, key: &K) {
        self.durations.remove(key);
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Register a new timer, aborting the one it replaces.
    pub(crate) fn replace_timer(&mut self, key: K, generation: u64, handle: AbortHandle) {
        if let Some(old) = self.timers.insert(key, Timer { generation, handle }) {
            old.handle.abort();
        }
    }

    pub(crate) fn cancel(&mut self, key: &K) {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
    }

    /// Unregister the timer if `generation` is still current.
    pub(crate) fn take_if_current(&mut self, key: &K, generation: u64) -> bool {
        match self.timers.get(key) {
            Some(timer) if timer.generation == generation => {
                self.timers.remove(key);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn has_timer(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.durations.keys().chain(self.timers.keys())
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}
