//! Configuration for the sync engine.

use growsync_protocol::EntityKind;
use std::time::Duration;
use uuid::Uuid;

/// Interval used by [`SyncScheduler::from_config`](crate::SyncScheduler::from_config)
/// when the configuration sets none.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The signed-in user.
    pub user_id: Uuid,
    /// Device ID (unique per installation).
    pub device_id: Uuid,
    /// Server URL.
    pub server_url: String,
    /// Token sent with every request.
    pub auth_token: Option<Vec<u8>>,
    /// Maximum entries per push request. Must not exceed the server's limit.
    pub push_batch_size: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Sync interval for automatic sync.
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(user_id: Uuid, device_id: Uuid, server_url: impl Into<String>) -> Self {
        Self {
            user_id,
            device_id,
            server_url: server_url.into(),
            auth_token: None,
            push_batch_size: 100,
            retry: RetryConfig::default(),
            sync_interval: None,
        }
    }

    /// Sets the auth token.
    pub fn with_auth_token(mut self, token: Vec<u8>) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Uuid::nil(), Uuid::nil(), "")
    }
}

/// Options of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Pull everything as if this were the first sync.
    pub force_full_resync: bool,
    /// Include media columns in pulled rows.
    pub include_media: bool,
    /// Limit the cycle to these entities (`None` = all).
    pub entities: Option<Vec<EntityKind>>,
}

impl SyncOptions {
    /// Creates default options: incremental, with media, all entities.
    pub fn new() -> Self {
        Self {
            force_full_resync: false,
            include_media: true,
            entities: None,
        }
    }

    /// Creates options for a forced full resync.
    pub fn full_resync() -> Self {
        Self::new().with_force_full_resync(true)
    }

    /// Sets whether to force a full resync.
    pub fn with_force_full_resync(mut self, force: bool) -> Self {
        self.force_full_resync = force;
        self
    }

    /// Sets whether media columns are pulled.
    pub fn with_include_media(mut self, include_media: bool) -> Self {
        self.include_media = include_media;
        self
    }

    /// Limits the cycle to the given entities.
    pub fn with_entities(mut self, entities: Vec<EntityKind>) -> Self {
        self.entities = Some(entities);
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25%
            let jitter = delay_secs * 0.25 * jitter_fraction();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Pseudo-random fraction in `[0, 1)` from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
