use std::fmt::Debug;

use super::Reducer;

/// What a middleware stage decided about a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<S> {
    /// Pass this state (possibly replaced) to the next stage.
    Next(S),
    /// Drop the transition; nothing is written.
    Veto,
}

/// One stage of the dispatch pipeline.
///
/// Stages run in registration order after the reducer, each seeing the
/// previous state, the action, and the state proposed so far.
pub trait Middleware<R: Reducer>: Send + Sync {
    /// Inspect, replace or veto the proposed `next` state.
    fn process(&self, previous: &R::State, action: &R::Action, next: R::State) -> Step<R::State>;
}

impl<R, F> Middleware<R> for F
where
    R: Reducer,
    F: Fn(&R::State, &R::Action, R::State) -> Step<R::State> + Send + Sync,
{
    fn process(&self, previous: &R::State, action: &R::Action, next: R::State) -> Step<R::State> {
        self(previous, action, next)
    }
}

/// Logs every transition at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

impl<R> Middleware<R> for TracingMiddleware
where
    R: Reducer,
    R::State: Debug,
    R::Action: Debug,
{
    fn process(&self, previous: &R::State, action: &R::Action, next: R::State) -> Step<R::State> {
        tracing::debug!(?action, ?previous, next = ?next, "dispatch");
        Step::Next(next)
    }
}
