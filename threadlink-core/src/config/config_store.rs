//! Hot-reloadable settings with change notification.
//!
//! `ConfigStore<T>` publishes immutable snapshots through a `watch`
//! channel. Readers take a cheap `Arc` snapshot; long-running loops hold a
//! [`ConfigWatcher`] and pick up a new snapshot when it changes.

use std::sync::Arc;
use tokio::sync::watch;

/// A shared, versioned settings cell.
pub struct ConfigStore<T> {
    tx: Arc<watch::Sender<Versioned<T>>>,
}

struct Versioned<T> {
    version: u64,
    value: Arc<T>,
}

/// Receives the snapshots published by a [`ConfigStore`].
pub struct ConfigWatcher<T> {
    rx: watch::Receiver<Versioned<T>>,
}

impl<T> ConfigStore<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(Versioned {
            version: 0,
            value: Arc::new(initial),
        });
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new snapshot to every watcher.
    pub fn update(&self, value: T) {
        self.tx.send_modify(|current| {
            current.version += 1;
            current.value = Arc::new(value);
        });
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<T> {
        Arc::clone(&self.tx.borrow().value)
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    pub fn subscribe(&self) -> ConfigWatcher<T> {
        ConfigWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> ConfigWatcher<T> {
    /// The snapshot this watcher last saw, marking it as seen.
    pub fn latest(&mut self) -> Arc<T> {
        Arc::clone(&self.rx.borrow_and_update().value)
    }

    /// Wait until a newer snapshot is published.
    ///
    /// Returns `Err` once the [`ConfigStore`] has been dropped.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }

    /// Whether a snapshot newer than the last [`latest`](Self::latest) exists.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_notifies_watchers() {
        let store = ConfigStore::new(1u32);
        let mut watcher = store.subscribe();
        assert_eq!(*watcher.latest(), 1);
        assert!(!watcher.has_changed());

        store.update(2);
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.latest(), 2);
        assert_eq!(*store.current(), 2);
        assert_eq!(store.version(), 1);
    }
}
