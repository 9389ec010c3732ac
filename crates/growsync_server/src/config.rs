//! Server configuration.

use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum entries accepted in one push.
    pub max_push_rows: usize,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Token lifetime.
    pub token_expiry: Duration,
    /// Age after which tombstones are pruned.
    pub tombstone_retention: Duration,
    /// How often the retention job runs.
    pub retention_interval: Duration,
    /// Resolve rows that coexist with their tombstone before each pull.
    pub resolve_conflicts_on_pull: bool,
}

impl ServerConfig {
    /// Creates a new server configuration with defaults.
    pub fn new() -> Self {
        Self {
            max_push_rows: 10_000,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
            tombstone_retention: Duration::from_secs(30 * 24 * 60 * 60),
            retention_interval: Duration::from_secs(60 * 60),
            resolve_conflicts_on_pull: true,
        }
    }

    /// Sets the maximum push size.
    pub fn with_max_push_rows(mut self, max: usize) -> Self {
        self.max_push_rows = max;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Sets the tombstone retention age.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// Sets the retention job interval.
    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }

    /// Enables or disables conflict resolution before pulls.
    pub fn with_resolve_conflicts_on_pull(mut self, enabled: bool) -> Self {
        self.resolve_conflicts_on_pull = enabled;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert!(!config.require_auth);
        assert!(config.resolve_conflicts_on_pull);
        assert_eq!(config.tombstone_retention, Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_push_rows(50)
            .with_retention_interval(Duration::from_secs(5))
            .with_resolve_conflicts_on_pull(false)
            .with_auth(vec![1, 2, 3, 4]);

        assert_eq!(config.max_push_rows, 50);
        assert_eq!(config.retention_interval, Duration::from_secs(5));
        assert!(!config.resolve_conflicts_on_pull);
        assert!(config.require_auth);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3, 4]));
    }
}
