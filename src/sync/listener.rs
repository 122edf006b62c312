use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::ChangeFeed;
use crate::store::Store;

/// Background task merging changes from other instances into a store.
///
/// The task holds only a weak reference to the store and stops when the
/// store is dropped, the feed closes, or this handle is dropped.
#[derive(Debug)]
pub struct CrossTabListener {
    task: JoinHandle<()>,
}

impl CrossTabListener {
    /// Start listening on `feed` on the current tokio runtime.
    pub fn spawn(store: &Store, feed: Arc<dyn ChangeFeed>) -> Self {
        let mut receiver = feed.subscribe();
        let weak = store.downgrade();
        let task = tokio::spawn(async move {
            loop {
                let change = match receiver.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "change feed lagged; some external writes were missed");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.apply_external_change(&change);
            }
            tracing::debug!("cross-tab listener stopped");
        });
        Self { task }
    }

    /// Whether the listener task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop listening.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for CrossTabListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
