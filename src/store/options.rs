use std::time::Duration;

/// How a write is applied.
///
/// The default is an in-memory write that records history and keeps the
/// key's existing TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Mirror the value to the persistence adapter.
    pub persist: bool,
    /// Record the replaced value for undo.
    pub push_history: bool,
    /// Set (and keep) this TTL for the key.
    pub ttl: Option<Duration>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self::memory()
    }
}

impl WriteOptions {
    /// In-memory write with history.
    pub const fn memory() -> Self {
        Self {
            persist: false,
            push_history: true,
            ttl: None,
        }
    }

    /// Persisted write with history.
    pub const fn persisted() -> Self {
        Self {
            persist: true,
            push_history: true,
            ttl: None,
        }
    }

    /// Toggle persistence.
    #[must_use]
    pub const fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Skip the history record.
    #[must_use]
    pub const fn without_history(mut self) -> Self {
        self.push_history = false;
        self
    }

    /// Expire the entry `ttl` after this (and every later) write.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
