//! Background task retrying deletes that skipped an unreachable tier.
//!
//! Each tick also prunes the storage's mutation log.

use super::UnifiedStorage;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct StorageReconciler {
    storage: UnifiedStorage,
    interval: Duration,
}

impl StorageReconciler {
    pub fn new(storage: UnifiedStorage, interval: Duration) -> Self {
        Self { storage, interval }
    }

    /// Run until shutdown is signaled, then make one last attempt.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "StorageReconciler started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("StorageReconciler received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
            }
        }

        let remaining = self.storage.reconcile().await;
        if remaining > 0 {
            warn!(remaining, "Shutting down with unreconciled deletes");
        }
        info!("StorageReconciler shutdown complete");
    }

    async fn tick(&self) {
        self.storage.prune_mutation_log();
        if self.storage.pending_delete_count() == 0 {
            return;
        }
        let remaining = self.storage.reconcile().await;
        if remaining > 0 {
            warn!(remaining, "Pending deletes remain after reconciliation");
        } else {
            debug!("All pending deletes reconciled");
        }
    }
}
