use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::middleware::{Middleware, Step};
use crate::error::StoreError;
use crate::key::EntryKey;
use crate::runtime::Subscription;
use crate::store::{Store, WriteOptions};

/// Pure state transitions driven by a tagged action type.
///
/// `reduce` is expected to `match` exhaustively on the action, so adding a
/// variant is a compile error until every reducer handles it.
pub trait Reducer: Send + Sync + 'static {
    /// State held in the store.
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    /// Actions accepted by [`Reducer::reduce`].
    type Action: Send + Sync;

    /// State used when the entry is empty.
    fn initial(&self) -> Self::State;

    /// Compute the next state.
    fn reduce(&self, state: Self::State, action: &Self::Action) -> Self::State;
}

/// Outcome of [`StackFacade::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch<S> {
    /// The new state was written.
    Applied(S),
    /// A middleware vetoed; carries the unchanged current state.
    Vetoed(S),
}

impl<S> Dispatch<S> {
    /// The resulting state either way.
    pub fn into_state(self) -> S {
        match self {
            Self::Applied(state) | Self::Vetoed(state) => state,
        }
    }

    /// Whether the transition was written.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// A reducer bound to one store entry.
///
/// Each dispatch reads, reduces, runs the middleware chain and writes back
/// (with history) under the entry's pending token, so dispatches racing on
/// one entry apply one after another and none overwrites another's result.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), stowage::StoreError> {
/// use serde::{Deserialize, Serialize};
/// use stowage::{Reducer, StackFacade, Store};
///
/// #[derive(Clone, Default, Serialize, Deserialize)]
/// struct Counter {
///     value: i64,
/// }
///
/// enum CounterAction {
///     Add(i64),
///     Reset,
/// }
///
/// struct CounterReducer;
///
/// impl Reducer for CounterReducer {
///     type State = Counter;
///     type Action = CounterAction;
///
///     fn initial(&self) -> Counter {
///         Counter::default()
///     }
///
///     fn reduce(&self, state: Counter, action: &CounterAction) -> Counter {
///         match action {
///             CounterAction::Add(n) => Counter { value: state.value + n },
///             CounterAction::Reset => Counter::default(),
///         }
///     }
/// }
///
/// let store = Store::in_memory();
/// let counter = StackFacade::new(&store, "home", "counter", CounterReducer);
/// counter.dispatch(CounterAction::Add(2)).await?;
/// counter.dispatch(CounterAction::Add(3)).await?;
/// assert_eq!(counter.state().value, 5);
///
/// counter.dispatch(CounterAction::Reset).await?;
/// counter.undo().await;
/// assert_eq!(counter.state().value, 5);
/// # Ok(())
/// # }
/// ```
pub struct StackFacade<R: Reducer> {
    store: Store,
    entry: EntryKey,
    reducer: Arc<R>,
    middleware: Vec<Arc<dyn Middleware<R>>>,
    options: WriteOptions,
}

impl<R: Reducer> Clone for StackFacade<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            entry: self.entry.clone(),
            reducer: Arc::clone(&self.reducer),
            middleware: self.middleware.clone(),
            options: self.options,
        }
    }
}

impl<R: Reducer> StackFacade<R> {
    /// Bind `reducer` to `(scope, key)` of `store`.
    pub fn new(store: &Store, scope: &str, key: &str, reducer: R) -> Self {
        Self {
            store: store.clone(),
            entry: EntryKey::new(scope, key),
            reducer: Arc::new(reducer),
            middleware: Vec::new(),
            options: WriteOptions::memory(),
        }
    }

    /// Mirror the state to storage.
    #[must_use]
    pub fn persisted(mut self, persist: bool) -> Self {
        self.options = self.options.persist(persist);
        self
    }

    /// Expire the state `ttl` after the last dispatch.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.options = self.options.with_ttl(ttl);
        self
    }

    /// Append a middleware stage.
    #[must_use]
    pub fn with_middleware(mut self, middleware: impl Middleware<R> + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// The bound entry.
    pub fn entry(&self) -> &EntryKey {
        &self.entry
    }

    /// Current in-memory state.
    pub fn state(&self) -> R::State {
        self.store.typed_snapshot(&self.entry, self.reducer.initial())
    }

    /// Current state, hydrating first when persisted.
    pub async fn load(&self) -> R::State {
        self.store
            .read_async(
                self.entry.scope(),
                self.entry.key(),
                self.reducer.initial(),
                self.options.persist,
            )
            .await
    }

    /// Reduce `action` into the stored state.
    pub async fn dispatch(&self, action: R::Action) -> Result<Dispatch<R::State>, StoreError> {
        let reducer = &self.reducer;
        let middleware = &self.middleware;
        let written = self
            .store
            .update_entry(&self.entry, reducer.initial(), self.options, |current| {
                let previous = current.clone();
                let mut next = reducer.reduce(current, &action);
                for stage in middleware {
                    match stage.process(&previous, &action, next) {
                        Step::Next(state) => next = state,
                        Step::Veto => return None,
                    }
                }
                Some(next)
            })
            .await?;

        Ok(match written {
            Some(state) => Dispatch::Applied(state),
            None => {
                tracing::debug!(entry = %self.entry, "dispatch vetoed");
                Dispatch::Vetoed(self.state())
            }
        })
    }

    /// Write the initial state (undoable).
    pub async fn reset(&self) -> Result<R::State, StoreError> {
        self.store
            .write(
                self.entry.scope(),
                self.entry.key(),
                self.reducer.initial(),
                self.options,
            )
            .await
    }

    /// Step back one dispatch.
    pub async fn undo(&self) -> bool {
        self.store.undo(self.entry.scope(), self.entry.key()).await
    }

    /// Re-apply the last undone dispatch.
    pub async fn redo(&self) -> bool {
        self.store.redo(self.entry.scope(), self.entry.key()).await
    }

    /// Call `callback` with the state after dispatches settle.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(R::State) + Send + Sync + 'static,
    {
        self.store
            .slot(self.entry.scope(), self.entry.key(), self.reducer.initial())
            .subscribe(callback)
    }
}
