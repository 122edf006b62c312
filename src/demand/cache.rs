use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::context::{route_scope, NavigationContext};
use crate::error::{BoxError, StoreError};
use crate::key::EntryKey;
use crate::store::{Store, WriteOptions};

/// Load-once-per-context cache over a [`Store`] scope.
///
/// Several consumers mounting against the same screen share one load:
/// [`DemandCache::demand`] runs its loader only if the key is not yet loaded
/// in the current epoch. A failed loader leaves the key unloaded so the next
/// demand retries. Clearing the scope starts a new epoch.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), stowage::StoreError> {
/// use stowage::{DemandCache, Route, Store};
///
/// let store = Store::in_memory();
/// let cache = DemandCache::for_context(&store, &Route::new("/quiz"));
///
/// let ran = cache
///     .demand("list", |ctx| async move {
///         ctx.set("list", vec![1, 2, 3]).await?;
///         Ok::<(), stowage::BoxError>(())
///     })
///     .await?;
/// assert!(ran);
/// assert_eq!(cache.read("list", Vec::<i32>::new()), vec![1, 2, 3]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DemandCache {
    store: Store,
    scope: String,
    options: WriteOptions,
}

impl DemandCache {
    /// Cache scoped to the active route, as `route:<id>`.
    pub fn for_context(store: &Store, context: &(impl NavigationContext + ?Sized)) -> Self {
        Self::with_scope(store, route_scope(context))
    }

    /// Cache over an explicit scope.
    pub fn with_scope(store: &Store, scope: impl Into<String>) -> Self {
        Self {
            store: store.clone(),
            scope: scope.into(),
            options: WriteOptions::memory().without_history(),
        }
    }

    /// Mirror cached values to storage.
    #[must_use]
    pub fn persisted(mut self, persist: bool) -> Self {
        self.options = self.options.persist(persist);
        self
    }

    /// The scope this cache writes to.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Current value, or `default`.
    pub fn read<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.store.read_snapshot(&self.scope, key, default)
    }

    /// Whether `key` is loaded in the current epoch.
    pub fn is_loaded(&self, key: &str) -> bool {
        self.store.demand_loaded(&self.entry(key))
    }

    /// Run `loader` unless `key` is already loaded.
    ///
    /// Returns whether the loader ran. Concurrent demands for one key wait
    /// for the first and then skip.
    pub async fn demand<F, Fut>(&self, key: &str, loader: F) -> Result<bool, StoreError>
    where
        F: FnOnce(LoaderContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        self.run(key, None, loader).await
    }

    /// Like [`DemandCache::demand`], but a change in `deps` since the last
    /// load forces a reload.
    pub async fn demand_with<D, F, Fut>(
        &self,
        key: &str,
        deps: &D,
        loader: F,
    ) -> Result<bool, StoreError>
    where
        D: Hash + ?Sized,
        F: FnOnce(LoaderContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        self.run(key, Some(fingerprint(deps)), loader).await
    }

    async fn run<F, Fut>(
        &self,
        key: &str,
        fingerprint: Option<u64>,
        loader: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(LoaderContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let entry = self.entry(key);
        if self.store.demand_begin(&entry, fingerprint).is_none() {
            return Ok(false);
        }
        let _token = self.store.demand_token(&entry).await;
        // Another caller may have finished loading while we waited.
        let Some(generation) = self.store.demand_begin(&entry, fingerprint) else {
            return Ok(false);
        };

        tracing::debug!(scope = %self.scope, key, generation, "running demand loader");
        match loader(LoaderContext { cache: self.clone() }).await {
            Ok(()) => {
                if !self.store.demand_finish(&entry, generation) {
                    tracing::debug!(scope = %self.scope, key, "flag reset during load; next demand reloads");
                }
                Ok(true)
            }
            Err(source) => {
                let error = StoreError::Loader {
                    scope: self.scope.clone(),
                    key: key.to_owned(),
                    source,
                };
                tracing::warn!(%error, "demand loader failed; key left unloaded");
                Err(error)
            }
        }
    }

    /// Write `value` and mark `key` loaded.
    pub async fn set<T: Serialize>(&self, key: &str, value: T) -> Result<T, StoreError> {
        let value = self.store.write(&self.scope, key, value, self.options).await?;
        self.store.demand_set_loaded(&self.entry(key));
        Ok(value)
    }

    /// Transform the current value (or `default`) and mark `key` loaded.
    pub async fn update<T, F>(&self, key: &str, default: T, f: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let entry = self.entry(key);
        let next = self
            .store
            .replace_entry(&entry, default, self.options, f)
            .await?;
        self.store.demand_set_loaded(&entry);
        Ok(next)
    }

    /// Force the next demand for `key` to reload, including when a load is
    /// in flight. The value stays readable.
    pub fn invalidate(&self, key: &str) {
        self.store.demand_invalidate(&self.entry(key));
    }

    /// Drop every value and loaded flag in this cache's scope.
    pub async fn clear(&self) -> usize {
        self.store
            .clear_scope(&self.scope, self.options.persist)
            .await
    }

    fn entry(&self, key: &str) -> EntryKey {
        EntryKey::new(self.scope.as_str(), key)
    }
}

/// Accessors handed to a demand loader.
#[derive(Clone, Debug)]
pub struct LoaderContext {
    cache: DemandCache,
}

impl LoaderContext {
    /// Scope being loaded into.
    pub fn scope(&self) -> &str {
        &self.cache.scope
    }

    /// Current value of `key` in the cache scope.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.cache.read(key, default)
    }

    /// Write `key` in the cache scope.
    pub async fn set<T: Serialize>(&self, key: &str, value: T) -> Result<T, StoreError> {
        self.cache
            .store
            .write(&self.cache.scope, key, value, self.cache.options)
            .await
    }
}

fn fingerprint<D: Hash + ?Sized>(deps: &D) -> u64 {
    let mut hasher = DefaultHasher::new();
    deps.hash(&mut hasher);
    hasher.finish()
}
