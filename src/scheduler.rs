//! Periodic blocklist refresh.

use crate::error::Result;
use crate::loader::{ArchiveLoader, LoadOutcome};
use crate::store::BlocklistStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Runs the archive loader against a store on a fixed interval.
pub struct RefreshScheduler {
    loader: Arc<ArchiveLoader>,
    store: Arc<BlocklistStore>,
    interval: Duration,
}

impl RefreshScheduler {
    /// Create a scheduler refreshing `store` through `loader` every `interval`.
    pub fn new(loader: Arc<ArchiveLoader>, store: Arc<BlocklistStore>, interval: Duration) -> Self {
        Self {
            loader,
            store,
            interval,
        }
    }

    /// Run one refresh and log its outcome.
    pub async fn refresh_once(&self) -> Result<LoadOutcome> {
        let result = self.loader.load(&self.store).await;

        match &result {
            Ok(LoadOutcome::Replaced {
                found,
                stored,
                version,
            }) => {
                info!(found, stored, version = ?version, "Blocklist refreshed");
            }
            Ok(LoadOutcome::Unchanged { version }) => {
                debug!(version = %version, "Blocklist version unchanged");
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Failed to refresh blocklist");
            }
        }

        result
    }

    /// Refresh every interval until `shutdown` flips to true or its sender
    /// is dropped. The first refresh happens one interval after start.
    ///
    /// A refresh in flight when shutdown arrives is abandoned; the store
    /// only changes on a completed load, so it keeps the previous list.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                // Errors are already logged; the next tick retries.
                _ = self.refresh_once() => {}
                changed = shutdown.changed() => {
                    debug!("Refresh abandoned for shutdown");
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Refresh scheduler shutting down");
    }
}
