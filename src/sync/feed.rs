use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A write to shared storage, as seen by other instances on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageChange {
    /// Physical key that changed.
    pub key: String,
    /// Serialized value before the change, when known.
    pub old_value: Option<String>,
    /// Serialized value after the change; `None` means the key was removed.
    pub new_value: Option<String>,
    /// Store instance that made the change, if it was a store.
    pub origin: Option<Uuid>,
}

impl StorageChange {
    /// A change that sets `key` to `value`.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            old_value: None,
            new_value: Some(value.into()),
            origin: None,
        }
    }

    /// A change that removes `key`.
    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            old_value: None,
            new_value: None,
            origin: None,
        }
    }

    /// Tag the change with the instance that made it.
    #[must_use]
    pub fn from_origin(mut self, origin: Uuid) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Publish/subscribe channel for storage changes between instances.
pub trait ChangeFeed: Send + Sync {
    /// Announce a change to every subscriber.
    fn publish(&self, change: StorageChange);

    /// Receive changes published after this call.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// [`ChangeFeed`] over a tokio broadcast channel.
///
/// Clones share the channel; hand one clone to each store instance.
#[derive(Debug, Clone)]
pub struct BroadcastFeed {
    sender: broadcast::Sender<StorageChange>,
}

impl BroadcastFeed {
    /// Create a feed buffering up to `capacity` undelivered changes per
    /// receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeFeed for BroadcastFeed {
    fn publish(&self, change: StorageChange) {
        // No receivers is fine: nobody else is listening.
        let _ = self.sender.send(change);
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.sender.subscribe()
    }
}
