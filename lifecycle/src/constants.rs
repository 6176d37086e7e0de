//! Token lifecycle constants.

/// Default policy values used by [`crate::config::LifecycleConfig`].
pub mod defaults {
    /// Rotation grace period, in seconds.
    pub const GRACE_PERIOD_SECS: i64 = 30;

    /// Device token lifetime, in days.
    pub const DEVICE_TOKEN_TTL_DAYS: i64 = 90;

    /// Refresh token lifetime, in days.
    pub const REFRESH_TOKEN_TTL_DAYS: i64 = 30;

    /// Row lock wait bound, in milliseconds.
    pub const LOCK_TIMEOUT_MS: u64 = 5_000;

    /// Statement bound, in milliseconds.
    pub const STATEMENT_TIMEOUT_MS: u64 = 10_000;

    /// Trust score assigned to a newly registered device.
    pub const INITIAL_TRUST_SCORE: f64 = 1.0;
}

/// Raw refresh token entropy, in bytes (256 bits).
pub const REFRESH_TOKEN_BYTES: usize = 32;

/// Metric names emitted by the lifecycle manager.
pub mod metric_names {
    /// Refresh token consumptions, labelled by `outcome`.
    pub const REFRESH_TOTAL: &str = "token_lifecycle.refresh.total";

    /// Refresh token replays that triggered global invalidation.
    pub const REFRESH_REUSE_DETECTED: &str = "token_lifecycle.refresh.reuse_detected";

    /// Device token rotations, labelled by `outcome`.
    pub const ROTATION_TOTAL: &str = "token_lifecycle.rotation.total";

    /// Device token validate-or-create calls, labelled by `outcome`.
    pub const PROVISION_TOTAL: &str = "token_lifecycle.provision.total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_share_prefix() {
        for name in [
            metric_names::REFRESH_TOTAL,
            metric_names::REFRESH_REUSE_DETECTED,
            metric_names::ROTATION_TOTAL,
            metric_names::PROVISION_TOTAL,
        ] {
            assert!(name.starts_with("token_lifecycle."));
        }
    }
}
