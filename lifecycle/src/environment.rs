//! Token lifecycle environment.
//!
//! This module defines the environment type for dependency injection into
//! the lifecycle manager: the store, the codec, the clock and the policy.

use crate::config::LifecycleConfig;
use crate::providers::{TokenCodec, TokenStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Clock trait - abstracts time operations for testability.
///
/// Every timestamp the manager writes comes from the clock, never from the
/// database's `NOW()`, so grace periods and expiry can be simulated.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Token lifecycle environment.
///
/// # Type Parameters
///
/// - `S`: Token store
#[derive(Clone)]
pub struct LifecycleEnvironment<S>
where
    S: TokenStore,
{
    /// Transactional token store.
    pub store: S,

    /// Hashing and device token encoding.
    pub codec: Arc<dyn TokenCodec>,

    /// Time source.
    pub clock: Arc<dyn Clock>,

    /// Policy values.
    pub config: LifecycleConfig,
}

impl<S> LifecycleEnvironment<S>
where
    S: TokenStore,
{
    /// Create a new environment using the system clock and default policy.
    #[must_use]
    pub fn new(store: S, codec: Arc<dyn TokenCodec>) -> Self {
        Self {
            store,
            codec,
            clock: Arc::new(SystemClock),
            config: LifecycleConfig::default(),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the policy.
    #[must_use]
    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }
}
