//! Sync engine state machine.

use crate::config::{SyncConfig, SyncOptions};
use crate::error::{SyncError, SyncResult};
use crate::replica::{ApplyStats, PendingChanges, ReplicaStore};
use crate::transport::SyncTransport;
use growsync_protocol::{
    ConflictCheckRequest, EntityKind, PullRequest, PushRequest, ResolutionAction, RowRejection,
    Timestamp,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is pulling changes from the server.
    Pulling,
    /// Engine is pushing changes to the server.
    Pushing,
    /// Engine has completed a sync cycle.
    Synced,
    /// Engine encountered an error.
    Error,
    /// Engine is waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of rows pulled.
    pub rows_pulled: u64,
    /// Total number of entries pushed.
    pub rows_pushed: u64,
    /// Total number of entries the server refused.
    pub rows_rejected: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Number of entries pulled.
    pub pulled: usize,
    /// Counts from merging the pull into the replica.
    pub merged: ApplyStats,
    /// Number of entries pushed.
    pub pushed: usize,
    /// Pushed entries the server wrote.
    pub applied: u32,
    /// Pushed entries the server skipped (it held a newer version).
    pub skipped: u32,
    /// Pushed entries the server refused.
    pub rejected: Vec<RowRejection>,
    /// Watermark after the cycle.
    pub watermark: Option<Timestamp>,
    /// Whether the sync was successful.
    pub success: bool,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

/// The sync engine drives pull-then-push cycles against a server.
///
/// At most one cycle runs at a time; a second caller gets
/// [`SyncError::SyncInProgress`]. Local state only changes through the
/// replica's transactional merge and acknowledgement, so a failed cycle
/// leaves dirty rows and the watermark as they were.
pub struct SyncEngine<T: SyncTransport, R: ReplicaStore> {
    config: SyncConfig,
    transport: Arc<T>,
    replica: Arc<R>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cycle: Mutex<()>,
    cancelled: AtomicBool,
}

impl<T: SyncTransport, R: ReplicaStore> SyncEngine<T, R> {
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, transport: T, replica: R) -> Self {
        Self::with_shared(config, Arc::new(transport), Arc::new(replica))
    }

    /// Creates a sync engine over a transport and replica shared with the app.
    pub fn with_shared(config: SyncConfig, transport: Arc<T>, replica: Arc<R>) -> Self {
        Self {
            config,
            transport,
            replica,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cycle: Mutex::new(()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Returns the replica.
    pub fn replica(&self) -> &Arc<R> {
        &self.replica
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the stored watermark.
    pub fn watermark(&self) -> Option<Timestamp> {
        self.replica.watermark()
    }

    /// Cancels any ongoing sync operation.
    ///
    /// Takes effect at the next safe point: after the pull is merged, before
    /// each push batch, or between retries. A batch already sent is always
    /// acknowledged.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Performs one sync cycle: pull, merge, push, acknowledge.
    pub fn sync(&self, options: &SyncOptions) -> SyncResult<SyncCycleResult> {
        let _cycle = self.cycle.try_lock().ok_or(SyncError::SyncInProgress)?;
        self.reset_cancel();
        self.attempt(options)
    }

    /// Performs a sync with retry on transient errors.
    ///
    /// The whole retry loop counts as one cycle for the single-flight guard.
    pub fn sync_with_retry(&self, options: &SyncOptions) -> SyncResult<SyncCycleResult> {
        let _cycle = self.cycle.try_lock().ok_or(SyncError::SyncInProgress)?;
        self.reset_cancel();

        let retry_config = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry_config.max_attempts {
            if attempt > 0 {
                self.set_state(SyncState::RetryWait);
                let delay = retry_config.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, "retrying sync");
                std::thread::sleep(delay);

                self.stats.write().retries += 1;
            }

            if let Err(e) = self.check_cancelled() {
                self.set_state(SyncState::Idle);
                return Err(e);
            }

            match self.attempt(options) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if e.is_retryable() && attempt + 1 < retry_config.max_attempts {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Protocol("No sync attempts made".into())))
    }

    /// Asks the server to settle a delete-vs-modify conflict on one row.
    pub fn check_conflict(&self, kind: EntityKind, id: Uuid) -> SyncResult<ResolutionAction> {
        let since = self.replica.watermark().unwrap_or(Timestamp::MIN);
        let request = ConflictCheckRequest::new(kind, id, since).with_user(self.config.user_id);
        let response = self.transport.check_conflict(&request)?;
        tracing::debug!(
            entity = %kind,
            id = %id,
            action = %response.resolution_action,
            "conflict checked"
        );
        Ok(response.resolution_action)
    }

    fn attempt(&self, options: &SyncOptions) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        match self.run_cycle(options) {
            Ok(mut result) => {
                result.duration = start.elapsed();
                self.set_state(SyncState::Synced);
                self.record_success(&result);
                tracing::info!(
                    pulled = result.pulled,
                    pushed = result.pushed,
                    skipped = result.skipped,
                    rejected = result.rejected.len(),
                    watermark = ?result.watermark,
                    "sync cycle completed"
                );
                Ok(result)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    fn run_cycle(&self, options: &SyncOptions) -> SyncResult<SyncCycleResult> {
        let mut result = SyncCycleResult::default();
        let stored = self.replica.watermark();
        let since = if options.force_full_resync {
            None
        } else {
            stored
        };

        // Pull and merge.
        self.set_state(SyncState::Pulling);
        let mut request = PullRequest::new(self.config.user_id, since)
            .with_device(self.config.device_id)
            .with_include_media(options.include_media);
        if let Some(kinds) = &options.entities {
            request = request.with_entities(kinds);
        }
        let pulled = self.transport.pull(&request)?;
        let overlaps = pulled.changes.bucket_overlaps();
        if !overlaps.is_empty() {
            tracing::warn!(count = overlaps.len(), "pulled ids appear in several buckets");
        }
        result.pulled = pulled.changes.len();
        result.merged =
            self.replica
                .apply_remote(&pulled.changes, stored, options.include_media)?;

        self.check_cancelled()?;

        // Collect and push against the pre-pull watermark.
        let pending = self
            .replica
            .pending_changes(options.entities.as_deref())?;

        if !pending.is_empty() {
            self.set_state(SyncState::Pushing);
            // Batches are acknowledged one by one; the watermark moves only
            // after the last.
            for batch in pending.batches(self.config.push_batch_size) {
                self.check_cancelled()?;
                self.push_batch(&batch, stored, &mut result)?;
                self.replica.acknowledge(&batch, None)?;
            }
        }

        // A pull limited to some entities says nothing about the others.
        let watermark = covers_all(options.entities.as_deref()).then_some(pulled.timestamp);
        if watermark.is_some() {
            self.replica.acknowledge(&PendingChanges::default(), watermark)?;
        }

        result.watermark = self.replica.watermark();
        result.success = true;
        Ok(result)
    }

    fn push_batch(
        &self,
        batch: &PendingChanges,
        since: Option<Timestamp>,
        result: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        let request = PushRequest::new(&batch.changes, since, self.config.user_id)?
            .with_device(self.config.device_id)
            .with_media_omitted(&batch.media_omitted);
        let response = self.transport.push(&request)?;
        if !response.success {
            return Err(SyncError::PushRejected(
                response.error.unwrap_or_else(|| "push failed".into()),
            ));
        }
        for rejection in &response.rejected {
            tracing::warn!(
                entity = %rejection.entity,
                id = ?rejection.id,
                reason = %rejection.reason,
                "server refused row"
            );
        }
        tracing::debug!(entries = batch.len(), applied = response.applied, "pushed batch");
        result.pushed += batch.len();
        result.applied += response.applied;
        result.skipped += response.skipped;
        result.rejected.extend(response.rejected);
        Ok(())
    }

    fn record_success(&self, result: &SyncCycleResult) {
        let mut stats = self.stats.write();
        stats.cycles_completed += 1;
        stats.rows_pulled += result.pulled as u64;
        stats.rows_pushed += result.pushed as u64;
        stats.rows_rejected += result.rejected.len() as u64;
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = None;
    }

    /// Handles an error by updating state and stats.
    fn handle_error(&self, error: &SyncError) {
        if matches!(error, SyncError::Cancelled) {
            self.set_state(SyncState::Idle);
            tracing::debug!("sync cancelled");
            return;
        }
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());
        tracing::warn!(error = %error, retryable = error.is_retryable(), "sync cycle failed");
    }
}

fn covers_all(entities: Option<&[EntityKind]>) -> bool {
    entities.map_or(true, |e| EntityKind::ALL.iter().all(|k| e.contains(k)))
}
