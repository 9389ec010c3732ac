//! Tombstone retention.
//!
//! Pruning is storage hygiene and runs on its own schedule. A replica that
//! stays offline for longer than the retention window can miss deletions.

use crate::store::ServerStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Background task that prunes old tombstones on an interval.
pub struct RetentionJob {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RetentionJob {
    /// Prunes tombstones older than `retention` once. Returns how many went.
    pub fn run_once(store: &ServerStore, retention: Duration) -> usize {
        let cutoff = store.now().saturating_sub(retention);
        let pruned = store.prune_tombstones(cutoff);
        tracing::info!(pruned, %cutoff, "tombstone retention pass");
        pruned
    }

    /// Spawns the job on the current tokio runtime.
    ///
    /// The first pass runs immediately. A zero interval is treated as one
    /// millisecond.
    pub fn spawn(store: Arc<ServerStore>, retention: Duration, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_once(&store, retention);
                    }
                    _ = signal.notified() => break,
                }
            }
            tracing::debug!("retention job stopped");
        });
        Self { shutdown, handle }
    }

    /// Stops the job and waits for it to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "retention job ended abnormally");
        }
    }
}
