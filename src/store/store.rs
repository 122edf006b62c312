use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use uuid::Uuid;

use super::history::History;
use super::ttl::TtlTable;
use super::{Slot, WriteOptions};
use crate::config::StoreConfig;
use crate::error::{AdapterError, StoreError};
use crate::key::{EntryKey, KeyCodec};
use crate::persist::{NullAdapter, PersistenceAdapter};
use crate::runtime::{lock, Notifier, PendingGuard, PendingTokens, Subscription};
use crate::sync::{ChangeFeed, StorageChange};

/// Loaded state of one demand key. `generation` changes whenever the flag
/// is reset, so a load that started earlier cannot mark it loaded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DemandFlag {
    loaded: bool,
    fingerprint: Option<u64>,
    generation: u64,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<EntryKey, Value>,
    hydrated: HashSet<EntryKey>,
    persisted: HashSet<EntryKey>,
    history: HashMap<EntryKey, History>,
    ttl: TtlTable<EntryKey>,
    scope_refs: HashMap<String, usize>,
    auto_clear: HashSet<String>,
    demand: HashMap<EntryKey, DemandFlag>,
    demand_generation: u64,
}

impl StoreState {
    fn next_demand_generation(&mut self) -> u64 {
        self.demand_generation += 1;
        self.demand_generation
    }

    /// Every key the state knows anything about.
    fn known_keys(&self) -> HashSet<EntryKey> {
        self.entries
            .keys()
            .chain(self.hydrated.iter())
            .chain(self.persisted.iter())
            .chain(self.history.keys())
            .chain(self.ttl.keys())
            .chain(self.demand.keys())
            .cloned()
            .collect()
    }
}

pub(crate) struct StoreInner {
    id: Uuid,
    config: StoreConfig,
    codec: KeyCodec,
    adapter: Arc<dyn PersistenceAdapter>,
    feed: Option<Arc<dyn ChangeFeed>>,
    handle: Option<Handle>,
    state: Mutex<StoreState>,
    tokens: PendingTokens<EntryKey>,
    demand_tokens: PendingTokens<EntryKey>,
    notifier: Notifier<EntryKey, Value>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        lock(&self.state).ttl.cancel_all();
    }
}

/// Scope-partitioned reactive state store.
///
/// Entries are addressed by `(scope, key)` and held in memory as JSON
/// values; typed access deserializes at the call site. Persisted entries are
/// mirrored through a [`PersistenceAdapter`], hydrated at most once, and kept
/// authoritative in memory when storage fails.
///
/// Every read-modify-write on one entry runs under that entry's pending
/// token, so concurrent writers apply in arrival order and none is lost.
/// Subscribers are notified after a deferred flush that coalesces bursts of
/// writes.
///
/// Cloning is cheap and every clone addresses the same store.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), stowage::StoreError> {
/// use stowage::{Store, WriteOptions};
///
/// let store = Store::in_memory();
/// store
///     .write("signup_flow", "step", 2, WriteOptions::default())
///     .await?;
/// assert_eq!(store.read_snapshot("signup_flow", "step", 0), 2);
///
/// store.undo("signup_flow", "step").await;
/// assert_eq!(store.read_snapshot("signup_flow", "step", 0), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Non-owning handle to a [`Store`].
#[derive(Clone)]
pub struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    /// The store, if it is still alive.
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder {
    config: StoreConfig,
    adapter: Option<Arc<dyn PersistenceAdapter>>,
    feed: Option<Arc<dyn ChangeFeed>>,
    handle: Option<Handle>,
}

impl StoreBuilder {
    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Mirror persisted entries through `adapter`.
    pub fn adapter(self, adapter: impl PersistenceAdapter + 'static) -> Self {
        self.shared_adapter(Arc::new(adapter))
    }

    /// Mirror persisted entries through an already shared adapter.
    pub fn shared_adapter(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Announce persisted writes on `feed` for other instances.
    pub fn change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Spawn timers and notification flushes on this runtime.
    ///
    /// Defaults to the runtime current at [`StoreBuilder::build`], if any.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Validate the configuration and create the store.
    pub fn build(self) -> Result<Store, StoreError> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> Store {
        let handle = self.handle.or_else(|| Handle::try_current().ok());
        if handle.is_none() {
            tracing::debug!("no tokio runtime; notifications flush inline and TTLs are inert");
        }
        let inner = StoreInner {
            id: Uuid::new_v4(),
            codec: KeyCodec::from_config(&self.config),
            config: self.config,
            adapter: self.adapter.unwrap_or_else(|| Arc::new(NullAdapter)),
            feed: self.feed,
            notifier: Notifier::new(handle.clone()),
            handle,
            state: Mutex::new(StoreState::default()),
            tokens: PendingTokens::new(),
            demand_tokens: PendingTokens::new(),
        };
        Store {
            inner: Arc::new(inner),
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Back,
    Forward,
}

impl Store {
    /// Start building a store.
    pub fn builder() -> StoreBuilder {
        StoreBuilder {
            config: StoreConfig::default(),
            adapter: None,
            feed: None,
            handle: None,
        }
    }

    /// A store with default configuration that persists nothing.
    pub fn in_memory() -> Self {
        Self::builder().assemble()
    }

    /// Identifier of this instance, used as the origin of published changes.
    pub fn instance_id(&self) -> Uuid {
        self.inner.id
    }

    /// The configuration in effect.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The physical key codec in effect.
    pub fn codec(&self) -> &KeyCodec {
        &self.inner.codec
    }

    /// A non-owning handle.
    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Typed handle to one entry.
    pub fn slot<T>(&self, scope: &str, key: &str, default: T) -> Slot<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        Slot::new(self.clone(), EntryKey::new(scope, key), default)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current in-memory value, or `default`. Never waits and never does I/O.
    pub fn read_snapshot<T: DeserializeOwned>(&self, scope: &str, key: &str, default: T) -> T {
        self.typed_snapshot(&EntryKey::new(scope, key), default)
    }

    /// Current in-memory value as JSON.
    pub fn snapshot_value(&self, scope: &str, key: &str) -> Option<Value> {
        lock(&self.inner.state)
            .entries
            .get(&EntryKey::new(scope, key))
            .cloned()
    }

    /// Whether an in-memory value exists.
    pub fn contains(&self, scope: &str, key: &str) -> bool {
        lock(&self.inner.state)
            .entries
            .contains_key(&EntryKey::new(scope, key))
    }

    /// Read after any in-flight operation on the entry completes.
    ///
    /// With `persist`, the first call per entry hydrates from storage.
    pub async fn read_async<T: DeserializeOwned>(
        &self,
        scope: &str,
        key: &str,
        default: T,
        persist: bool,
    ) -> T {
        let entry = EntryKey::new(scope, key);
        let _token = self.inner.tokens.acquire(&entry).await;
        if persist {
            self.hydrate_locked(&entry).await;
        }
        self.typed_snapshot(&entry, default)
    }

    /// Whether hydration has been attempted for the entry.
    pub fn is_hydrated(&self, scope: &str, key: &str) -> bool {
        lock(&self.inner.state)
            .hydrated
            .contains(&EntryKey::new(scope, key))
    }

    /// Scopes that currently hold values.
    pub fn scopes(&self) -> Vec<String> {
        let state = lock(&self.inner.state);
        let scopes: BTreeSet<&str> = state.entries.keys().map(EntryKey::scope).collect();
        scopes.into_iter().map(str::to_owned).collect()
    }

    /// Keys holding values in `scope`.
    pub fn keys(&self, scope: &str) -> Vec<String> {
        let state = lock(&self.inner.state);
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|entry| entry.scope() == scope)
            .map(|entry| entry.key().to_owned())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn typed_snapshot<T: DeserializeOwned>(&self, entry: &EntryKey, default: T) -> T {
        let value = lock(&self.inner.state).entries.get(entry).cloned();
        match value {
            Some(value) => decode_or(entry, value, default),
            None => default,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `value` and return it.
    ///
    /// Only a value that cannot be serialized fails the write; storage
    /// failures are logged and the in-memory value stands.
    pub async fn write<T: Serialize>(
        &self,
        scope: &str,
        key: &str,
        value: T,
        options: WriteOptions,
    ) -> Result<T, StoreError> {
        let json = serde_json::to_value(&value)?;
        let entry = EntryKey::new(scope, key);
        let _token = self.inner.tokens.acquire(&entry).await;
        if options.persist {
            self.hydrate_locked(&entry).await;
        }
        self.commit_locked(&entry, json, options).await;
        Ok(value)
    }

    /// Read, transform and write back under one token acquisition.
    ///
    /// `f` receives the current value (or `default`) and returns the next
    /// one, or `None` to leave the entry untouched. Returns what was written.
    pub async fn update<T, F>(
        &self,
        scope: &str,
        key: &str,
        default: T,
        options: WriteOptions,
        f: F,
    ) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> Option<T>,
    {
        self.update_entry(&EntryKey::new(scope, key), default, options, f)
            .await
    }

    pub(crate) async fn update_entry<T, F>(
        &self,
        entry: &EntryKey,
        default: T,
        options: WriteOptions,
        f: F,
    ) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> Option<T>,
    {
        let _token = self.inner.tokens.acquire(entry).await;
        if options.persist {
            self.hydrate_locked(entry).await;
        }
        let current = self.typed_snapshot(entry, default);
        let Some(next) = f(current) else {
            return Ok(None);
        };
        let json = serde_json::to_value(&next)?;
        self.commit_locked(entry, json, options).await;
        Ok(Some(next))
    }

    /// Like [`Store::update_entry`] for transforms that always write.
    pub(crate) async fn replace_entry<T, F>(
        &self,
        entry: &EntryKey,
        default: T,
        options: WriteOptions,
        f: F,
    ) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let _token = self.inner.tokens.acquire(entry).await;
        if options.persist {
            self.hydrate_locked(entry).await;
        }
        let next = f(self.typed_snapshot(entry, default));
        let json = serde_json::to_value(&next)?;
        self.commit_locked(entry, json, options).await;
        Ok(next)
    }

    /// Apply a write. The caller holds the entry's token.
    async fn commit_locked(&self, entry: &EntryKey, value: Value, options: WriteOptions) {
        {
            let mut state = lock(&self.inner.state);
            let previous = state.entries.insert(entry.clone(), value.clone());
            if options.push_history {
                state
                    .history
                    .entry(entry.clone())
                    .or_default()
                    .record(previous, self.inner.config.max_history_depth);
            }
            if options.persist {
                state.persisted.insert(entry.clone());
            }
            if let Some(ttl) = options.ttl {
                state.ttl.set_duration(entry.clone(), ttl);
            } else if state.ttl.duration(entry).is_none() {
                if let Some(ttl) = self.inner.config.default_ttl() {
                    state.ttl.set_duration(entry.clone(), ttl);
                }
            }
            self.rearm_timer(&mut state, entry);
        }

        tracing::debug!(scope = entry.scope(), key = entry.key(), persist = options.persist, "entry written");
        self.inner.notifier.mark(entry.clone(), Some(value.clone()));
        if options.persist {
            self.persist_value(entry, &value).await;
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Call `callback` after writes to the entry settle.
    ///
    /// The callback receives the entry's latest value, or `None` once it has
    /// been removed. Holding the returned guard keeps the scope referenced.
    pub fn subscribe<F>(&self, scope: &str, key: &str, callback: F) -> Subscription
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let entry = EntryKey::new(scope, key);
        let id = self
            .inner
            .notifier
            .subscribe(entry.clone(), Arc::new(callback));
        *lock(&self.inner.state)
            .scope_refs
            .entry(scope.to_owned())
            .or_insert(0) += 1;

        let weak = self.downgrade();
        Subscription::new(move || {
            if let Some(store) = weak.upgrade() {
                store.release_subscription(&entry, id);
            }
        })
    }

    fn release_subscription(&self, entry: &EntryKey, id: u64) {
        if !self.inner.notifier.unsubscribe(entry, id) {
            return;
        }
        let should_clear = {
            let mut state = lock(&self.inner.state);
            let remaining = match state.scope_refs.get_mut(entry.scope()) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                state.scope_refs.remove(entry.scope());
            }
            remaining == 0 && state.auto_clear.contains(entry.scope())
        };
        if should_clear {
            let scope = entry.scope().to_owned();
            let evicted = self.evict_where(|candidate| candidate.scope() == scope);
            tracing::debug!(%scope, evicted = evicted.len(), "last subscriber left; scope auto-cleared");
        }
    }

    /// Live subscriptions held against `scope`.
    pub fn scope_ref_count(&self, scope: &str) -> usize {
        lock(&self.inner.state)
            .scope_refs
            .get(scope)
            .copied()
            .unwrap_or(0)
    }

    /// Opt `scope` in (or out) of clearing its in-memory state when its last
    /// subscriber leaves. Persisted copies are kept and re-hydrate on next use.
    pub fn set_auto_clear(&self, scope: &str, enabled: bool) {
        let mut state = lock(&self.inner.state);
        if enabled {
            state.auto_clear.insert(scope.to_owned());
        } else {
            state.auto_clear.remove(scope);
        }
    }

    /// Deliver pending notifications now instead of on the next flush.
    pub fn flush_notifications(&self) {
        self.inner.notifier.flush();
    }

    // =========================================================================
    // TTL
    // =========================================================================

    /// Expire the entry `ttl` from now, and again after every later write.
    pub fn set_ttl(&self, scope: &str, key: &str, ttl: Duration) {
        let entry = EntryKey::new(scope, key);
        let mut state = lock(&self.inner.state);
        state.ttl.set_duration(entry.clone(), ttl);
        self.rearm_timer(&mut state, &entry);
    }

    /// Stop expiring the entry.
    pub fn clear_ttl(&self, scope: &str, key: &str) {
        let entry = EntryKey::new(scope, key);
        let mut state = lock(&self.inner.state);
        state.ttl.remove_duration(&entry);
        state.ttl.cancel(&entry);
    }

    /// The entry's TTL, if any.
    pub fn ttl(&self, scope: &str, key: &str) -> Option<Duration> {
        lock(&self.inner.state)
            .ttl
            .duration(&EntryKey::new(scope, key))
    }

    fn rearm_timer(&self, state: &mut StoreState, entry: &EntryKey) {
        let Some(duration) = state.ttl.duration(entry) else {
            state.ttl.cancel(entry);
            return;
        };
        let Some(handle) = &self.inner.handle else {
            tracing::warn!(scope = entry.scope(), key = entry.key(), "no runtime; TTL not armed");
            return;
        };
        let generation = state.ttl.next_generation();
        let weak = self.downgrade();
        let key = entry.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(store) = weak.upgrade() {
                store.expire(&key, generation).await;
            }
        });
        state
            .ttl
            .replace_timer(entry.clone(), generation, task.abort_handle());
    }

    async fn expire(&self, entry: &EntryKey, generation: u64) {
        let _token = self.inner.tokens.acquire(entry).await;
        let had_value = {
            let mut state = lock(&self.inner.state);
            if !state.ttl.take_if_current(entry, generation) {
                return;
            }
            state.history.remove(entry);
            state.persisted.remove(entry);
            state.entries.remove(entry).is_some()
        };
        tracing::debug!(scope = entry.scope(), key = entry.key(), "entry expired");
        if had_value {
            self.inner.notifier.mark(entry.clone(), None);
        }
        self.remove_persisted(entry).await;
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Clear every entry in `scope`. Returns how many entries were evicted.
    pub async fn clear_scope(&self, scope: &str, remove_persisted: bool) -> usize {
        self.clear_where(|entry| entry.scope() == scope, remove_persisted)
            .await
    }

    /// Clear a single entry.
    pub async fn clear_key(&self, scope: &str, key: &str, remove_persisted: bool) -> usize {
        self.clear_where(
            |entry| entry.scope() == scope && entry.key() == key,
            remove_persisted,
        )
        .await
    }

    /// Clear every scope whose name starts with `prefix`.
    pub async fn clear_by_prefix(&self, prefix: &str, remove_persisted: bool) -> usize {
        self.clear_where(|entry| entry.scope().starts_with(prefix), remove_persisted)
            .await
    }

    /// Clear every entry for which `condition(scope, key)` holds.
    pub async fn clear_by_condition<F>(&self, condition: F, remove_persisted: bool) -> usize
    where
        F: Fn(&str, &str) -> bool,
    {
        self.clear_where(
            |entry| condition(entry.scope(), entry.key()),
            remove_persisted,
        )
        .await
    }

    async fn clear_where<F>(&self, predicate: F, remove_persisted: bool) -> usize
    where
        F: Fn(&EntryKey) -> bool,
    {
        let evicted = self.evict_where(&predicate);
        let count = evicted.len();
        if !remove_persisted {
            return count;
        }

        let mut targets = BTreeSet::new();
        for entry in &evicted {
            targets.insert(self.inner.codec.encode(entry));
            targets.extend(self.inner.codec.encode_legacy(entry));
        }
        // Copies that were never hydrated are only visible through the adapter.
        match self.inner.adapter.keys().await {
            Ok(keys) => targets.extend(keys.into_iter().filter(|physical| {
                self.inner
                    .codec
                    .decode(physical)
                    .is_some_and(|entry| predicate(&entry))
            })),
            Err(source) => {
                let error = StoreError::Persist {
                    key: "<keys>".to_owned(),
                    source,
                };
                tracing::warn!(%error, "could not list persisted keys; clearing known keys only");
            }
        }

        for physical in targets {
            self.remove_physical(&physical).await;
        }
        count
    }

    /// Drop in-memory state, timers, history and demand flags for matching
    /// entries and notify their subscribers.
    fn evict_where<F>(&self, predicate: F) -> Vec<EntryKey>
    where
        F: Fn(&EntryKey) -> bool,
    {
        let (evicted, removed_values) = {
            let mut state = lock(&self.inner.state);
            let evicted: Vec<EntryKey> = state
                .known_keys()
                .into_iter()
                .filter(|entry| predicate(entry))
                .collect();
            let mut removed_values = Vec::new();
            for entry in &evicted {
                if state.entries.remove(entry).is_some() {
                    removed_values.push(entry.clone());
                }
                state.history.remove(entry);
                state.hydrated.remove(entry);
                state.persisted.remove(entry);
                state.ttl.cancel(entry);
                state.ttl.remove_duration(entry);
                state.demand.remove(entry);
            }
            (evicted, removed_values)
        };
        for entry in removed_values {
            self.inner.notifier.mark(entry, None);
        }
        evicted
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Restore the value before the last write. Returns whether anything
    /// changed.
    pub async fn undo(&self, scope: &str, key: &str) -> bool {
        self.travel(&EntryKey::new(scope, key), Direction::Back)
            .await
    }

    /// Re-apply the last undone write. Returns whether anything changed.
    pub async fn redo(&self, scope: &str, key: &str) -> bool {
        self.travel(&EntryKey::new(scope, key), Direction::Forward)
            .await
    }

    /// Whether [`Store::undo`] would change the entry.
    pub fn can_undo(&self, scope: &str, key: &str) -> bool {
        self.history_len(scope, key).0 > 0
    }

    /// Whether [`Store::redo`] would change the entry.
    pub fn can_redo(&self, scope: &str, key: &str) -> bool {
        self.history_len(scope, key).1 > 0
    }

    /// `(past, future)` history depths for the entry.
    pub fn history_len(&self, scope: &str, key: &str) -> (usize, usize) {
        lock(&self.inner.state)
            .history
            .get(&EntryKey::new(scope, key))
            .map_or((0, 0), |history| (history.past_len(), history.future_len()))
    }

    async fn travel(&self, entry: &EntryKey, direction: Direction) -> bool {
        let _token = self.inner.tokens.acquire(entry).await;
        let (restored, persisted) = {
            let mut state = lock(&self.inner.state);
            let depth = self.inner.config.max_history_depth;
            let current = state.entries.get(entry).cloned();
            let Some(history) = state.history.get_mut(entry) else {
                return false;
            };
            let restored = match direction {
                Direction::Back => history.undo(current, depth),
                Direction::Forward => history.redo(current, depth),
            };
            let Some(restored) = restored else {
                return false;
            };
            match &restored {
                Some(value) => {
                    state.entries.insert(entry.clone(), value.clone());
                }
                None => {
                    state.entries.remove(entry);
                }
            }
            self.rearm_timer(&mut state, entry);
            (restored, state.persisted.contains(entry))
        };

        self.inner.notifier.mark(entry.clone(), restored.clone());
        if persisted {
            match &restored {
                Some(value) => self.persist_value(entry, value).await,
                None => self.remove_persisted(entry).await,
            }
        }
        true
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Load the persisted copy once. The caller holds the entry's token.
    async fn hydrate_locked(&self, entry: &EntryKey) {
        if !lock(&self.inner.state).hydrated.insert(entry.clone()) {
            return;
        }

        let physical = self.inner.codec.encode(entry);
        let raw = match self.inner.adapter.get(&physical).await {
            Ok(raw) => raw,
            Err(source) => {
                let error = StoreError::Hydration {
                    key: physical,
                    source,
                };
                tracing::warn!(%error, "hydration failed; continuing in memory");
                return;
            }
        };
        let (raw, legacy_key) = match raw {
            Some(raw) => (Some(raw), None),
            None => self.legacy_lookup(entry).await,
        };
        let Some(raw) = raw else {
            tracing::debug!(physical_key = %physical, "nothing persisted");
            return;
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                let error = StoreError::Hydration {
                    key: legacy_key.unwrap_or(physical),
                    source: AdapterError::Serialization(err),
                };
                tracing::warn!(%error, "discarding unparseable persisted value");
                return;
            }
        };

        let inserted = {
            let mut state = lock(&self.inner.state);
            // An eviction while the adapter was busy drops the hydrated mark.
            if !state.hydrated.contains(entry) {
                None
            } else {
                state.persisted.insert(entry.clone());
                if state.entries.contains_key(entry) {
                    Some(false)
                } else {
                    state.entries.insert(entry.clone(), value.clone());
                    Some(true)
                }
            }
        };
        let Some(inserted) = inserted else {
            tracing::debug!(physical_key = %physical, "entry cleared during hydration; discarding loaded value");
            return;
        };
        if inserted {
            tracing::debug!(physical_key = %physical, "hydrated");
            self.inner.notifier.mark(entry.clone(), Some(value));
        }

        if let Some(legacy_key) = legacy_key {
            match self.inner.adapter.set(&physical, &raw).await {
                Ok(()) => {
                    self.remove_physical(&legacy_key).await;
                    tracing::info!(from = %legacy_key, to = %physical, "migrated legacy key");
                }
                Err(source) => {
                    let error = StoreError::Persist {
                        key: physical,
                        source,
                    };
                    tracing::warn!(%error, "legacy key migration failed");
                }
            }
        }
    }

    async fn legacy_lookup(&self, entry: &EntryKey) -> (Option<String>, Option<String>) {
        if !self.inner.config.legacy_fallback {
            return (None, None);
        }
        let Some(legacy_key) = self.inner.codec.encode_legacy(entry) else {
            return (None, None);
        };
        match self.inner.adapter.get(&legacy_key).await {
            Ok(Some(raw)) => (Some(raw), Some(legacy_key)),
            Ok(None) => (None, None),
            Err(source) => {
                let error = StoreError::Hydration {
                    key: legacy_key,
                    source,
                };
                tracing::warn!(%error, "legacy lookup failed");
                (None, None)
            }
        }
    }

    async fn persist_value(&self, entry: &EntryKey, value: &Value) {
        let physical = self.inner.codec.encode(entry);
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                let error = StoreError::Persist {
                    key: physical,
                    source: AdapterError::Serialization(err),
                };
                tracing::warn!(%error, "value kept in memory only");
                return;
            }
        };
        match self.inner.adapter.set(&physical, &raw).await {
            Ok(()) => self.publish(StorageChange::set(physical, raw)),
            Err(source) => {
                let error = StoreError::Persist {
                    key: physical,
                    source,
                };
                tracing::warn!(%error, "value kept in memory only");
            }
        }
    }

    async fn remove_persisted(&self, entry: &EntryKey) {
        self.remove_physical(&self.inner.codec.encode(entry)).await;
        if let Some(legacy_key) = self.inner.codec.encode_legacy(entry) {
            self.remove_physical(&legacy_key).await;
        }
    }

    async fn remove_physical(&self, physical: &str) {
        match self.inner.adapter.remove(physical).await {
            Ok(()) => self.publish(StorageChange::removed(physical)),
            Err(source) => {
                let error = StoreError::Persist {
                    key: physical.to_owned(),
                    source,
                };
                tracing::warn!(%error, "persisted copy not removed");
            }
        }
    }

    fn publish(&self, change: StorageChange) {
        if let Some(feed) = &self.inner.feed {
            feed.publish(change.from_origin(self.inner.id));
        }
    }

    // =========================================================================
    // Cross-instance sync
    // =========================================================================

    /// Merge a storage change made by another instance.
    ///
    /// Changes from this instance and keys outside its prefix are ignored.
    /// Returns whether the in-memory state was touched.
    pub fn apply_external_change(&self, change: &StorageChange) -> bool {
        if change.origin == Some(self.inner.id) {
            return false;
        }
        let Some(entry) = self.inner.codec.decode(&change.key) else {
            return false;
        };

        match &change.new_value {
            None => {
                let removed = {
                    let mut state = lock(&self.inner.state);
                    state.hydrated.insert(entry.clone());
                    state.entries.remove(&entry).is_some()
                };
                if removed {
                    tracing::debug!(scope = entry.scope(), key = entry.key(), "external removal applied");
                    self.inner.notifier.mark(entry, None);
                }
                removed
            }
            Some(raw) => {
                let value: Value = match serde_json::from_str(raw) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(physical_key = %change.key, error = %err, "ignoring unparseable external change");
                        return false;
                    }
                };
                {
                    let mut state = lock(&self.inner.state);
                    state.hydrated.insert(entry.clone());
                    state.persisted.insert(entry.clone());
                    state.entries.insert(entry.clone(), value.clone());
                }
                tracing::debug!(scope = entry.scope(), key = entry.key(), "external write applied");
                self.inner.notifier.mark(entry, Some(value));
                true
            }
        }
    }

    // =========================================================================
    // Demand flags
    // =========================================================================

    pub(crate) async fn demand_token(
        &self,
        entry: &EntryKey,
    ) -> PendingGuard<'_, EntryKey> {
        self.inner.demand_tokens.acquire(entry).await
    }

    /// Start a load of the entry for `fingerprint`.
    ///
    /// Returns the generation the load runs under, or `None` when the entry
    /// is already loaded for this fingerprint. A changed fingerprint resets
    /// the flag under a new generation.
    pub(crate) fn demand_begin(&self, entry: &EntryKey, fingerprint: Option<u64>) -> Option<u64> {
        let mut state = lock(&self.inner.state);
        let current = state
            .demand
            .get(entry)
            .copied()
            .filter(|flag| flag.fingerprint == fingerprint);
        match current {
            Some(flag) if flag.loaded => None,
            Some(flag) => Some(flag.generation),
            None => {
                let generation = state.next_demand_generation();
                state.demand.insert(
                    entry.clone(),
                    DemandFlag {
                        loaded: false,
                        fingerprint,
                        generation,
                    },
                );
                Some(generation)
            }
        }
    }

    /// Mark the entry loaded if the flag is still at `generation`. Returns
    /// whether it was marked.
    pub(crate) fn demand_finish(&self, entry: &EntryKey, generation: u64) -> bool {
        let mut state = lock(&self.inner.state);
        match state.demand.get_mut(entry) {
            Some(flag) if flag.generation == generation => {
                flag.loaded = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn demand_loaded(&self, entry: &EntryKey) -> bool {
        lock(&self.inner.state)
            .demand
            .get(entry)
            .is_some_and(|flag| flag.loaded)
    }

    /// Mark the entry loaded by a direct write.
    pub(crate) fn demand_set_loaded(&self, entry: &EntryKey) {
        let mut state = lock(&self.inner.state);
        if let Some(flag) = state.demand.get_mut(entry) {
            flag.loaded = true;
            return;
        }
        let generation = state.next_demand_generation();
        state.demand.insert(
            entry.clone(),
            DemandFlag {
                loaded: true,
                fingerprint: None,
                generation,
            },
        );
    }

    /// Reset the flag so the next demand reloads and in-flight loads are
    /// not counted.
    pub(crate) fn demand_invalidate(&self, entry: &EntryKey) {
        let mut state = lock(&self.inner.state);
        let generation = state.next_demand_generation();
        if let Some(flag) = state.demand.get_mut(entry) {
            flag.loaded = false;
            flag.generation = generation;
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Abort every TTL timer and deliver pending notifications.
    pub fn shutdown(&self) {
        lock(&self.inner.state).ttl.cancel_all();
        self.inner.notifier.flush();
        tracing::debug!(instance = %self.inner.id, "store shut down");
    }
}

fn decode_or<T: DeserializeOwned>(entry: &EntryKey, value: Value, default: T) -> T {
    match serde_json::from_value(value) {
        Ok(typed) => typed,
        Err(err) => {
            tracing::warn!(scope = entry.scope(), key = entry.key(), error = %err, "stored value has an unexpected shape; using default");
            default
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("scopes", &self.scopes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryAdapter;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Signup {
        step: u32,
    }

    fn persisted_store() -> (Store, MemoryAdapter) {
        let adapter = MemoryAdapter::new();
        let store = Store::builder().adapter(adapter.clone()).build().unwrap();
        (store, adapter)
    }

    #[tokio::test]
    async fn snapshot_sees_write_before_notification() {
        let store = Store::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let _sub = store.subscribe("s", "k", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.write("s", "k", 7, WriteOptions::default()).await.unwrap();
        assert_eq!(store.read_snapshot("s", "k", 0), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        store.flush_notifications();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn burst_of_writes_notifies_once_with_latest() {
        let store = Store::in_memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = store.subscribe("s", "k", move |value| {
            seen_clone.lock().unwrap().push(value.cloned());
        });

        for i in 1..=3 {
            store.write("s", "k", i, WriteOptions::default()).await.unwrap();
        }
        store.flush_notifications();
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(3))]);
    }

    #[tokio::test]
    async fn wrong_shape_reads_as_default() {
        let store = Store::in_memory();
        store.write("s", "k", "text", WriteOptions::default()).await.unwrap();
        assert_eq!(store.read_snapshot("s", "k", 5u32), 5);
    }

    #[tokio::test]
    async fn persisted_write_mirrors_to_adapter() {
        let (store, adapter) = persisted_store();
        store
            .write("signup_flow", "signup", Signup { step: 1 }, WriteOptions::persisted())
            .await
            .unwrap();
        assert_eq!(
            adapter.raw("@store:signup_flow::signup").as_deref(),
            Some(r#"{"step":1}"#)
        );
    }

    #[tokio::test]
    async fn hydrates_once() {
        let adapter = MemoryAdapter::new();
        adapter.insert_raw("@store:s::k", "41");
        let store = Store::builder().adapter(adapter.clone()).build().unwrap();

        assert_eq!(store.read_snapshot("s", "k", 0), 0);
        assert_eq!(store.read_async("s", "k", 0, true).await, 41);
        assert!(store.is_hydrated("s", "k"));

        // Later storage changes are not re-read.
        adapter.insert_raw("@store:s::k", "99");
        assert_eq!(store.read_async("s", "k", 0, true).await, 41);
    }

    #[tokio::test]
    async fn legacy_key_is_read_and_migrated() {
        let adapter = MemoryAdapter::new();
        adapter.insert_raw("@store:s:k", r#"{"step":3}"#);
        let store = Store::builder().adapter(adapter.clone()).build().unwrap();

        let value = store.read_async("s", "k", Signup { step: 0 }, true).await;
        assert_eq!(value, Signup { step: 3 });
        assert_eq!(adapter.raw("@store:s::k").as_deref(), Some(r#"{"step":3}"#));
        assert_eq!(adapter.raw("@store:s:k"), None);
    }

    #[tokio::test]
    async fn legacy_fallback_can_be_disabled() {
        let adapter = MemoryAdapter::new();
        adapter.insert_raw("@store:s:k", "3");
        let config = StoreConfig {
            legacy_fallback: false,
            ..StoreConfig::default()
        };
        let store = Store::builder()
            .config(config)
            .adapter(adapter.clone())
            .build()
            .unwrap();

        assert_eq!(store.read_async("s", "k", 0, true).await, 0);
        assert_eq!(adapter.raw("@store:s:k").as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn unparseable_persisted_value_degrades_to_default() {
        let adapter = MemoryAdapter::new();
        adapter.insert_raw("@store:s::k", "{not json");
        let store = Store::builder().adapter(adapter).build().unwrap();
        assert_eq!(store.read_async("s", "k", 5, true).await, 5);
    }

    #[tokio::test]
    async fn storage_failure_keeps_memory_authoritative() {
        let (store, adapter) = persisted_store();
        adapter.set_failing(true);

        let written = store
            .write("s", "k", 10, WriteOptions::persisted())
            .await
            .unwrap();
        assert_eq!(written, 10);
        assert_eq!(store.read_snapshot("s", "k", 0), 10);
        assert_eq!(store.read_async("s", "k", 0, true).await, 10);
        assert!(adapter.is_empty());
    }

    #[tokio::test]
    async fn update_can_veto() {
        let store = Store::in_memory();
        store.write("s", "k", 1, WriteOptions::default()).await.unwrap();

        let vetoed = store
            .update("s", "k", 0, WriteOptions::default(), |_: i32| None)
            .await
            .unwrap();
        assert_eq!(vetoed, None);
        assert_eq!(store.history_len("s", "k"), (1, 0));

        let next = store
            .update("s", "k", 0, WriteOptions::default(), |n: i32| Some(n + 1))
            .await
            .unwrap();
        assert_eq!(next, Some(2));
    }

    #[tokio::test]
    async fn undo_of_first_write_removes_entry() {
        let store = Store::in_memory();
        store.write("s", "k", "a", WriteOptions::default()).await.unwrap();
        assert!(store.undo("s", "k").await);
        assert!(!store.contains("s", "k"));
        assert!(!store.undo("s", "k").await);
        assert!(store.redo("s", "k").await);
        assert_eq!(store.read_snapshot("s", "k", String::new()), "a");
    }

    #[tokio::test]
    async fn undo_persists_restored_value() {
        let (store, adapter) = persisted_store();
        store.write("s", "k", 1, WriteOptions::persisted()).await.unwrap();
        store.write("s", "k", 2, WriteOptions::persisted()).await.unwrap();

        store.undo("s", "k").await;
        assert_eq!(adapter.raw("@store:s::k").as_deref(), Some("1"));
        store.undo("s", "k").await;
        assert_eq!(adapter.raw("@store:s::k"), None);
    }

    #[tokio::test]
    async fn write_without_history() {
        let store = Store::in_memory();
        store
            .write("s", "k", 1, WriteOptions::default().without_history())
            .await
            .unwrap();
        assert!(!store.can_undo("s", "k"));
    }

    #[tokio::test]
    async fn history_depth_is_bounded_by_config() {
        let config = StoreConfig {
            max_history_depth: 2,
            ..StoreConfig::default()
        };
        let store = Store::builder().config(config).build().unwrap();
        for i in 0..5 {
            store.write("s", "k", i, WriteOptions::default()).await.unwrap();
        }
        assert_eq!(store.history_len("s", "k"), (2, 0));
    }

    #[tokio::test]
    async fn auto_clear_when_last_subscriber_leaves() {
        let store = Store::in_memory();
        store.set_auto_clear("wizard", true);
        store.write("wizard", "a", 1, WriteOptions::default()).await.unwrap();

        let first = store.subscribe("wizard", "a", |_| {});
        let second = store.subscribe("wizard", "b", |_| {});
        assert_eq!(store.scope_ref_count("wizard"), 2);

        drop(first);
        assert!(store.contains("wizard", "a"));
        second.unsubscribe();
        assert_eq!(store.scope_ref_count("wizard"), 0);
        assert!(!store.contains("wizard", "a"));
    }

    #[tokio::test]
    async fn scopes_without_auto_clear_survive_unsubscribe() {
        let store = Store::in_memory();
        store.write("keep", "a", 1, WriteOptions::default()).await.unwrap();
        store.subscribe("keep", "a", |_| {}).unsubscribe();
        assert!(store.contains("keep", "a"));
    }

    #[tokio::test]
    async fn clear_by_prefix_and_condition() {
        let store = Store::in_memory();
        for scope in ["signup_flow", "signup_otp", "quiz"] {
            store.write(scope, "a", 1, WriteOptions::default()).await.unwrap();
            store.write(scope, "b", 2, WriteOptions::default()).await.unwrap();
        }

        assert_eq!(store.clear_by_prefix("signup_", false).await, 4);
        assert_eq!(store.scopes(), vec!["quiz"]);

        assert_eq!(store.clear_by_condition(|_, key| key == "b", false).await, 1);
        assert_eq!(store.keys("quiz"), vec!["a"]);
    }

    #[tokio::test]
    async fn clear_scope_removes_unhydrated_persisted_copies() {
        let (store, adapter) = persisted_store();
        adapter.insert_raw("@store:flow::never_loaded", "1");
        adapter.insert_raw("@store:flow:legacy", "2");
        adapter.insert_raw("@store:other::kept", "3");
        store.write("flow", "k", 1, WriteOptions::persisted()).await.unwrap();

        store.clear_scope("flow", true).await;
        assert_eq!(adapter.len(), 1);
        assert_eq!(adapter.raw("@store:other::kept").as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn clear_without_persisted_keeps_storage() {
        let (store, adapter) = persisted_store();
        store.write("flow", "k", 1, WriteOptions::persisted()).await.unwrap();
        store.clear_scope("flow", false).await;

        assert!(!store.contains("flow", "k"));
        assert_eq!(adapter.len(), 1);
        // The copy comes back on next hydration.
        assert_eq!(store.read_async("flow", "k", 0, true).await, 1);
    }

    #[tokio::test]
    async fn own_changes_are_ignored() {
        let store = Store::in_memory();
        let change = StorageChange::set("@store:s::k", "1").from_origin(store.instance_id());
        assert!(!store.apply_external_change(&change));
        assert!(!store.contains("s", "k"));
    }

    #[tokio::test]
    async fn external_changes_apply_and_remove() {
        let store = Store::in_memory();
        assert!(store.apply_external_change(&StorageChange::set("@store:s::k", "\"x\"")));
        assert_eq!(store.read_snapshot("s", "k", String::new()), "x");

        assert!(!store.apply_external_change(&StorageChange::set("@store:s::k", "{bad")));
        assert!(!store.apply_external_change(&StorageChange::set("elsewhere::k", "1")));

        assert!(store.apply_external_change(&StorageChange::removed("@store:s::k")));
        assert!(!store.contains("s", "k"));
    }

    #[tokio::test]
    async fn external_change_under_legacy_key_applies() {
        let store = Store::in_memory();
        assert!(store.apply_external_change(&StorageChange::set("@store:quiz:score", "7")));
        assert_eq!(store.read_snapshot("quiz", "score", 0), 7);

        assert!(store.apply_external_change(&StorageChange::removed("@store:quiz:score")));
        assert!(!store.contains("quiz", "score"));
    }

    /// Adapter whose reads return only after a delay.
    struct SlowGet {
        inner: MemoryAdapter,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl PersistenceAdapter for SlowGet {
        async fn get(&self, key: &str) -> Result<Option<String>, AdapterError> {
            let value = self.inner.get(key).await;
            tokio::time::sleep(self.delay).await;
            value
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), AdapterError> {
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), AdapterError> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> Result<Vec<String>, AdapterError> {
            self.inner.keys().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clear_during_hydration_is_not_undone() {
        let backing = MemoryAdapter::new();
        backing.insert_raw("@store:signup_flow::signup", r#"{"step":2}"#);
        let store = Store::builder()
            .adapter(SlowGet {
                inner: backing.clone(),
                delay: Duration::from_millis(50),
            })
            .build()
            .unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_async("signup_flow", "signup", Value::Null, true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear_scope("signup_flow", true).await;

        assert_eq!(reader.await.unwrap(), Value::Null);
        assert!(store.snapshot_value("signup_flow", "signup").is_none());
        assert!(backing.raw("@store:signup_flow::signup").is_none());
        assert!(!store.is_hydrated("signup_flow", "signup"));
    }

    #[test]
    fn works_without_runtime() {
        let store = Store::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let _sub = store.subscribe("s", "k", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(store.apply_external_change(&StorageChange::set("@store:s::k", "1")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        store.set_ttl("s", "k", Duration::from_secs(1));
        store.shutdown();
    }
}
