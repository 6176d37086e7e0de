//! Operation outcomes.
//!
//! Expected authentication failures are values, not errors. The route layer
//! matches on [`TokenFailure`] to choose a status code and never needs to
//! inspect error strings.

use crate::state::{DeviceId, Platform, Role, TokenRecordId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a presented token was rejected.
///
/// Each operation produces a subset of these:
///
/// | Failure          | refresh | rotate | provision |
/// |------------------|---------|--------|-----------|
/// | `InvalidToken`   | ✓       | ✓      | ✓         |
/// | `Expired`        | ✓       | ✓      |           |
/// | `InvalidVersion` | ✓       | ✓      | ✓         |
/// | `AlreadyRotated` |         | ✓      |           |
/// | `Revoked`        |         | ✓      |           |
/// | `TokenReuse`     | ✓       |        |           |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFailure {
    /// No row matches the token.
    InvalidToken,
    /// The row exists but is past its expiry.
    Expired,
    /// The token predates the user's current session epoch.
    InvalidVersion,
    /// The device token was rotated and the grace period has elapsed.
    AlreadyRotated,
    /// The device token was revoked for a reason other than rotation.
    Revoked,
    /// A consumed refresh token was presented again. Every session of the
    /// user has been invalidated as a side effect.
    TokenReuse,
}

impl TokenFailure {
    /// Stable machine-readable code.
    ///
    /// # Examples
    ///
    /// ```
    /// # use token_lifecycle::TokenFailure;
    /// assert_eq!(TokenFailure::AlreadyRotated.code(), "already_rotated");
    /// ```
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::Expired => "expired",
            Self::InvalidVersion => "invalid_version",
            Self::AlreadyRotated => "already_rotated",
            Self::Revoked => "revoked",
            Self::TokenReuse => "token_reuse",
        }
    }

    /// Message safe to show to the end user.
    ///
    /// Only reuse is distinguishable; everything else collapses to a generic
    /// message so clients learn nothing about why a token was refused.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::TokenReuse => "Session invalidated, please log in again",
            _ => "Authentication failed",
        }
    }

    /// Returns `true` if the failure invalidated every session of the user.
    #[must_use]
    pub const fn is_token_reuse(self) -> bool {
        matches!(self, Self::TokenReuse)
    }

    /// Returns `true` if the client must obtain a fresh credential by logging
    /// in again rather than retrying.
    ///
    /// Every domain failure qualifies; retryable conditions are reported as
    /// [`crate::LifecycleError`] instead.
    #[must_use]
    pub const fn requires_reauthentication(self) -> bool {
        true
    }
}

impl std::fmt::Display for TokenFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Refresh
// ═══════════════════════════════════════════════════════════════════════

/// Result of consuming a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshOutcome {
    /// The token was valid and has been consumed.
    Refreshed {
        /// Owner.
        user_id: UserId,
        /// Owner's current session epoch, to embed in new access tokens.
        token_version: i64,
        /// Owner's role.
        role: Role,
    },
    /// The token was refused.
    Rejected(TokenFailure),
}

impl RefreshOutcome {
    /// Whether the refresh succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Refreshed { .. })
    }

    /// Whether the refusal was a detected replay.
    #[must_use]
    pub const fn is_token_reuse(&self) -> bool {
        matches!(self, Self::Rejected(TokenFailure::TokenReuse))
    }

    /// The failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<TokenFailure> {
        match self {
            Self::Rejected(failure) => Some(*failure),
            Self::Refreshed { .. } => None,
        }
    }
}

/// A freshly issued refresh token. The raw value is only ever returned here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRefreshToken {
    /// Raw token to hand to the client.
    pub raw_token: String,
    /// Row id.
    pub id: TokenRecordId,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Rotation
// ═══════════════════════════════════════════════════════════════════════

/// Result of rotating a device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationOutcome {
    /// First, legitimate rotation: a new token was issued.
    Rotated {
        /// Raw replacement token.
        new_token: String,
        /// Replacement row id.
        device_token_id: TokenRecordId,
        /// Owner.
        user_id: UserId,
        /// Device.
        device_id: DeviceId,
        /// Platform.
        platform: Platform,
    },
    /// Duplicate request inside the grace period. The caller that won the
    /// rotation already holds the new token, so none is returned here.
    GracePeriodRetry {
        /// Successor row id.
        device_token_id: TokenRecordId,
        /// Owner.
        user_id: UserId,
        /// Device.
        device_id: DeviceId,
        /// Platform.
        platform: Platform,
    },
    /// The token was refused.
    Rejected(TokenFailure),
}

impl RotationOutcome {
    /// Whether the rotation (or its retry) succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    /// Whether this was absorbed as a grace-period retry.
    #[must_use]
    pub const fn is_grace_period_retry(&self) -> bool {
        matches!(self, Self::GracePeriodRetry { .. })
    }

    /// The new raw token, present only for a first rotation.
    #[must_use]
    pub fn new_token(&self) -> Option<&str> {
        match self {
            Self::Rotated { new_token, .. } => Some(new_token),
            _ => None,
        }
    }

    /// The id of the row that is now active for the device.
    #[must_use]
    pub const fn device_token_id(&self) -> Option<&TokenRecordId> {
        match self {
            Self::Rotated { device_token_id, .. }
            | Self::GracePeriodRetry { device_token_id, .. } => Some(device_token_id),
            Self::Rejected(_) => None,
        }
    }

    /// The failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<TokenFailure> {
        match self {
            Self::Rejected(failure) => Some(*failure),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Provisioning
// ═══════════════════════════════════════════════════════════════════════

/// A device token ready for use by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedDeviceToken {
    /// Raw token the client should keep.
    pub device_token: String,
    /// Row the token belongs to.
    pub device_token_record_id: TokenRecordId,
    /// Whether a new row was inserted.
    pub is_new: bool,
}

/// Result of validating or creating a device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionOutcome {
    /// A usable token.
    Ready(ProvisionedDeviceToken),
    /// The caller's context was refused.
    Rejected(TokenFailure),
}

impl ProvisionOutcome {
    /// Whether a usable token was produced.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The provisioned token, if any.
    #[must_use]
    pub const fn token(&self) -> Option<&ProvisionedDeviceToken> {
        match self {
            Self::Ready(token) => Some(token),
            Self::Rejected(_) => None,
        }
    }

    /// The failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<TokenFailure> {
        match self {
            Self::Rejected(failure) => Some(*failure),
            Self::Ready(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Maintenance
// ═══════════════════════════════════════════════════════════════════════

/// Result of logging a user out everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInvalidation {
    /// The user's session epoch after the bump.
    pub new_token_version: i64,
    /// Number of device tokens revoked.
    pub revoked_device_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_reuse_is_distinguishable_to_users() {
        assert_eq!(
            TokenFailure::TokenReuse.user_message(),
            "Session invalidated, please log in again"
        );
        for failure in [
            TokenFailure::InvalidToken,
            TokenFailure::Expired,
            TokenFailure::InvalidVersion,
            TokenFailure::AlreadyRotated,
            TokenFailure::Revoked,
        ] {
            assert_eq!(failure.user_message(), "Authentication failed");
            assert!(!failure.is_token_reuse());
        }
    }

    #[test]
    fn test_failure_serializes_as_code() {
        let json = serde_json::to_string(&TokenFailure::InvalidVersion).unwrap();
        assert_eq!(json, "\"invalid_version\"");
        assert_eq!(TokenFailure::InvalidVersion.to_string(), "invalid_version");
    }

    #[test]
    fn test_grace_period_retry_has_no_token() {
        let outcome = RotationOutcome::GracePeriodRetry {
            device_token_id: TokenRecordId("dt-2".into()),
            user_id: UserId::new("u1"),
            device_id: DeviceId::new("d1"),
            platform: Platform::Android,
        };

        assert!(outcome.is_success());
        assert!(outcome.is_grace_period_retry());
        assert_eq!(outcome.new_token(), None);
        assert_eq!(outcome.device_token_id().map(TokenRecordId::as_str), Some("dt-2"));
    }
}
