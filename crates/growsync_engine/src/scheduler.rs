//! Background sync scheduling.
//!
//! The host application owns a [`SyncScheduler`]: it runs cycles on an
//! interval or when triggered (app foregrounded, push notification) and
//! publishes a [`SyncStatus`] the UI can watch without ever blocking on
//! the network.

use crate::config::{SyncOptions, DEFAULT_SYNC_INTERVAL};
use crate::error::SyncError;
use crate::replica::ReplicaStore;
use crate::state::{SyncEngine, SyncState};
use crate::transport::SyncTransport;
use growsync_protocol::Timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Snapshot of the scheduler's view of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Engine state after the last cycle.
    pub state: SyncState,
    /// Stored watermark.
    pub watermark: Option<Timestamp>,
    /// Error of the last cycle, if it failed.
    pub last_error: Option<String>,
    /// Cycles completed by this scheduler.
    pub cycles: u64,
}

/// Runs sync cycles in the background.
pub struct SyncScheduler {
    trigger: Arc<Notify>,
    shutdown: Arc<Notify>,
    status: watch::Receiver<SyncStatus>,
    cancel: Box<dyn Fn() + Send + Sync>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawns the scheduler at the engine's configured sync interval, or
    /// [`DEFAULT_SYNC_INTERVAL`] when none is set.
    pub fn from_config<T, R>(engine: Arc<SyncEngine<T, R>>, options: SyncOptions) -> Self
    where
        T: SyncTransport + 'static,
        R: ReplicaStore + 'static,
    {
        let interval = engine.config().sync_interval.unwrap_or(DEFAULT_SYNC_INTERVAL);
        Self::spawn(engine, interval, options)
    }

    /// Spawns the scheduler on the current tokio runtime.
    ///
    /// The first cycle runs immediately. Cycles run on the blocking pool,
    /// one at a time; triggers arriving during a cycle coalesce into one.
    pub fn spawn<T, R>(
        engine: Arc<SyncEngine<T, R>>,
        interval: Duration,
        options: SyncOptions,
    ) -> Self
    where
        T: SyncTransport + 'static,
        R: ReplicaStore + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());
        let (tx, status) = watch::channel(SyncStatus {
            state: engine.state(),
            watermark: engine.watermark(),
            last_error: None,
            cycles: 0,
        });

        let cancel = {
            let engine = Arc::clone(&engine);
            Box::new(move || engine.cancel())
        };

        let wake = Arc::clone(&trigger);
        let stop = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut cycles = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.notified() => break,
                    _ = wake.notified() => {}
                    _ = ticker.tick() => {}
                }

                let worker = Arc::clone(&engine);
                let opts = options.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || worker.sync_with_retry(&opts)).await;
                let last_error = match outcome {
                    Ok(Ok(_)) => {
                        cycles += 1;
                        None
                    }
                    Ok(Err(SyncError::SyncInProgress)) => {
                        tracing::debug!("skipping scheduled sync, a cycle is running");
                        continue;
                    }
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => {
                        tracing::warn!(error = %e, "sync task ended abnormally");
                        Some(e.to_string())
                    }
                };

                tx.send_replace(SyncStatus {
                    state: engine.state(),
                    watermark: engine.watermark(),
                    last_error,
                    cycles,
                });
            }
            tracing::debug!("sync scheduler stopped");
        });

        Self {
            trigger,
            shutdown,
            status,
            cancel,
            handle,
        }
    }

    /// Requests a cycle as soon as possible.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Returns the latest status.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Returns a receiver that sees every status update.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stops the scheduler and waits for the running cycle, if any.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        (self.cancel)();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "sync scheduler ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncConfig};
    use crate::replica::MemoryReplica;
    use crate::transport::MockTransport;
    use growsync_protocol::{Changeset, PullResponse};
    use uuid::Uuid;

    fn engine() -> Arc<SyncEngine<MockTransport, MemoryReplica>> {
        engine_with(SyncConfig::new(Uuid::from_u128(1), Uuid::from_u128(2), "mock://"))
    }

    fn engine_with(config: SyncConfig) -> Arc<SyncEngine<MockTransport, MemoryReplica>> {
        let config = config.with_retry(RetryConfig::no_retry());
        let transport = MockTransport::new();
        transport.set_pull_response(PullResponse::new(
            Changeset::new(),
            Timestamp::from_millis(100),
        ));
        Arc::new(SyncEngine::new(config, transport, MemoryReplica::in_memory()))
    }

    fn hourly(engine: &Arc<SyncEngine<MockTransport, MemoryReplica>>) -> SyncScheduler {
        SyncScheduler::spawn(
            Arc::clone(engine),
            Duration::from_secs(3600),
            SyncOptions::default(),
        )
    }

    async fn wait_for_cycles(scheduler: &SyncScheduler, cycles: u64) -> SyncStatus {
        let mut rx = scheduler.subscribe();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.cycles >= cycles),
        )
        .await
        .expect("scheduler did not sync in time")
        .expect("scheduler dropped");
        status.clone()
    }

    #[tokio::test]
    async fn runs_first_cycle_immediately() {
        let engine = engine();
        let scheduler = hourly(&engine);

        let status = wait_for_cycles(&scheduler, 1).await;
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.watermark, Some(Timestamp::from_millis(100)));
        assert!(status.last_error.is_none());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_runs_another_cycle() {
        let engine = engine();
        let scheduler = hourly(&engine);
        wait_for_cycles(&scheduler, 1).await;

        scheduler.trigger();
        let status = wait_for_cycles(&scheduler, 2).await;
        assert_eq!(status.cycles, 2);
        assert_eq!(engine.transport().pull_requests().len(), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn failed_cycle_is_reported() {
        let engine = engine();
        engine.transport().set_connected(false);
        let scheduler = hourly(&engine);

        let mut rx = scheduler.subscribe();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.last_error.is_some()),
        )
        .await
        .expect("no status update")
        .expect("scheduler dropped")
        .clone();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.cycles, 0);
        assert_eq!(scheduler.status(), status);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn configured_interval_drives_cycles() {
        let config = SyncConfig::new(Uuid::from_u128(1), Uuid::from_u128(2), "mock://")
            .with_sync_interval(Duration::from_millis(10));
        let engine = engine_with(config);
        let scheduler = SyncScheduler::from_config(Arc::clone(&engine), SyncOptions::default());

        // no trigger: the ticks alone run the later cycles
        let status = wait_for_cycles(&scheduler, 3).await;
        assert!(status.cycles >= 3);
        assert!(engine.transport().pull_requests().len() >= 3);

        scheduler.shutdown().await;
    }
}
