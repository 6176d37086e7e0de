//! Token lifecycle configuration.
//!
//! Policy values (grace period, token lifetimes, store timeouts) should be
//! provided by the application, not hardcoded at call sites.

use crate::constants::defaults;
use chrono::Duration;
use serde::Deserialize;

/// Token lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "LifecycleConfigSeconds")]
pub struct LifecycleConfig {
    /// How long after a rotation a retry with the old device token is still
    /// answered with the successor's metadata instead of being rejected.
    ///
    /// Default: 30 seconds
    pub grace_period: Duration,

    /// Lifetime of a freshly issued or rotated device token.
    ///
    /// Default: 90 days
    pub device_token_ttl: Duration,

    /// Lifetime of a freshly issued refresh token.
    ///
    /// Default: 30 days
    pub refresh_token_ttl: Duration,

    /// Upper bound on waiting for a row lock inside a transaction.
    ///
    /// Default: 5 seconds
    pub lock_timeout: std::time::Duration,

    /// Upper bound on a single statement inside a transaction.
    ///
    /// Default: 10 seconds
    pub statement_timeout: std::time::Duration,
}

impl LifecycleConfig {
    /// Create configuration with default policy values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            grace_period: Duration::seconds(defaults::GRACE_PERIOD_SECS),
            device_token_ttl: Duration::days(defaults::DEVICE_TOKEN_TTL_DAYS),
            refresh_token_ttl: Duration::days(defaults::REFRESH_TOKEN_TTL_DAYS),
            lock_timeout: std::time::Duration::from_millis(defaults::LOCK_TIMEOUT_MS),
            statement_timeout: std::time::Duration::from_millis(defaults::STATEMENT_TIMEOUT_MS),
        }
    }

    /// Set the rotation grace period.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set the device token lifetime.
    #[must_use]
    pub const fn with_device_token_ttl(mut self, ttl: Duration) -> Self {
        self.device_token_ttl = ttl;
        self
    }

    /// Set the refresh token lifetime.
    #[must_use]
    pub const fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    /// Set the lock-wait timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the statement timeout.
    #[must_use]
    pub const fn with_statement_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized form: every duration in whole seconds, every field optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct LifecycleConfigSeconds {
    grace_period_secs: i64,
    device_token_ttl_secs: i64,
    refresh_token_ttl_secs: i64,
    lock_timeout_secs: u64,
    statement_timeout_secs: u64,
}

impl Default for LifecycleConfigSeconds {
    fn default() -> Self {
        Self {
            grace_period_secs: defaults::GRACE_PERIOD_SECS,
            device_token_ttl_secs: Duration::days(defaults::DEVICE_TOKEN_TTL_DAYS).num_seconds(),
            refresh_token_ttl_secs: Duration::days(defaults::REFRESH_TOKEN_TTL_DAYS).num_seconds(),
            lock_timeout_secs: defaults::LOCK_TIMEOUT_MS / 1000,
            statement_timeout_secs: defaults::STATEMENT_TIMEOUT_MS / 1000,
        }
    }
}

impl From<LifecycleConfigSeconds> for LifecycleConfig {
    fn from(raw: LifecycleConfigSeconds) -> Self {
        Self {
            grace_period: Duration::seconds(raw.grace_period_secs),
            device_token_ttl: Duration::seconds(raw.device_token_ttl_secs),
            refresh_token_ttl: Duration::seconds(raw.refresh_token_ttl_secs),
            lock_timeout: std::time::Duration::from_secs(raw.lock_timeout_secs),
            statement_timeout: std::time::Duration::from_secs(raw.statement_timeout_secs),
        }
    }
}
