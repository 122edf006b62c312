//! Reducer-driven access to a single store entry.
//!
//! A [`StackFacade`] binds a [`Reducer`] to one `(scope, key)` and exposes
//! serialized dispatch with an ordered [`Middleware`] chain.

mod facade;
mod middleware;

pub use facade::{Dispatch, Reducer, StackFacade};
pub use middleware::{Middleware, Step, TracingMiddleware};
