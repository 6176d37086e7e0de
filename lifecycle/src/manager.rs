//! Token lifecycle manager.
//!
//! The manager is a stateless set of operations over an injected
//! [`LifecycleEnvironment`]. Every operation opens exactly one store
//! transaction and either commits it or lets it roll back on drop; no
//! in-process lock participates in correctness.
//!
//! The operations are split by concern:
//!
//! - [`TokenLifecycleManager::consume_refresh_token`]: single-use refresh
//!   token consumption and reuse detection
//! - [`TokenLifecycleManager::rotate_device_token`]: device token rotation
//!   with a retry grace period
//! - [`TokenLifecycleManager::validate_or_create_device_token`]: device token
//!   validation and per-user serialized creation
//! - [`TokenLifecycleManager::issue_refresh_token`],
//!   [`TokenLifecycleManager::revoke_device_token`],
//!   [`TokenLifecycleManager::invalidate_user_sessions`],
//!   [`TokenLifecycleManager::sweep_expired_device_tokens`],
//!   [`TokenLifecycleManager::purge_refresh_tokens`] and
//!   [`TokenLifecycleManager::list_active_device_tokens`]: issuance, logout,
//!   sweeps and listings
//!
//! # Example
//!
//! ```ignore
//! use token_lifecycle::{LifecycleEnvironment, RequestMetadata, TokenLifecycleManager};
//!
//! let manager = TokenLifecycleManager::new(LifecycleEnvironment::new(store, codec));
//!
//! match manager.rotate_device_token(&raw, &RequestMetadata::from_ip("203.0.113.7")).await? {
//!     RotationOutcome::Rotated { new_token, .. } => respond_with(new_token),
//!     RotationOutcome::GracePeriodRetry { .. } => respond_unchanged(),
//!     RotationOutcome::Rejected(failure) => respond_unauthorized(failure),
//! }
//! ```

use crate::constants::metric_names;
use crate::environment::LifecycleEnvironment;
use crate::outcome::TokenFailure;
use crate::providers::TokenStore;
use chrono::{DateTime, Utc};

/// Atomic token lifecycle manager.
///
/// # Type Parameters
///
/// - `S`: Token store
#[derive(Clone)]
pub struct TokenLifecycleManager<S>
where
    S: TokenStore,
{
    pub(crate) env: LifecycleEnvironment<S>,
}

impl<S> TokenLifecycleManager<S>
where
    S: TokenStore,
{
    /// Create a new manager over the given environment.
    #[must_use]
    pub const fn new(env: LifecycleEnvironment<S>) -> Self {
        Self { env }
    }

    /// The injected environment.
    #[must_use]
    pub const fn environment(&self) -> &LifecycleEnvironment<S> {
        &self.env
    }

    /// Current time from the injected clock.
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.env.clock.now()
    }
}

/// Outcome label for a metric: `"success"`, `"grace_period_retry"`, or the
/// failure code.
pub(crate) fn record_outcome(metric: &'static str, outcome: &'static str) {
    metrics::counter!(metric, "outcome" => outcome).increment(1);
}

/// Records a rejection and hands the failure back for returning.
pub(crate) fn record_failure(metric: &'static str, failure: TokenFailure) -> TokenFailure {
    record_outcome(metric, failure.code());
    if failure.is_token_reuse() {
        metrics::counter!(metric_names::REFRESH_REUSE_DETECTED).increment(1);
    }
    failure
}
