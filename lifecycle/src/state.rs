//! Token lifecycle state types.
//!
//! Identifiers, enumerations, and the row shapes of the three tables the
//! lifecycle manager owns (`users`, `refresh_tokens`, `device_tokens`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════
// ID Types
// ═══════════════════════════════════════════════════════════════════════

/// Unique identifier for a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Wrap an existing user identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-chosen identifier for a physical device or browser profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Wrap an existing device identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key of a `refresh_tokens` or `device_tokens` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenRecordId(pub String);

impl TokenRecordId {
    /// Generate a new random record id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════

/// Error returned when a stored enumeration value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    /// Which enumeration was being parsed.
    pub kind: &'static str,
    /// The offending value.
    pub value: String,
}

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular account.
    User,
    /// Administrator.
    Admin,
}

impl Role {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Client platform a device token was issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Browser session.
    Web,
    /// Desktop application.
    Desktop,
    /// iOS application.
    Ios,
    /// Android application.
    Android,
}

impl Platform {
    /// All platforms, in declaration order.
    pub const ALL: [Self; 4] = [Self::Web, Self::Desktop, Self::Ios, Self::Android];

    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Desktop => "desktop",
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "desktop" => Ok(Self::Desktop),
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            other => Err(UnknownVariant {
                kind: "platform",
                value: other.to_string(),
            }),
        }
    }
}

/// Why a device token stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokedReason {
    /// Replaced by a successor during rotation.
    Rotated,
    /// Passed its expiry and was swept or superseded.
    Expired,
    /// The user logged out of the device (or everywhere).
    Logout,
    /// A refresh token replay was detected for the owning user.
    TokenReuseDetected,
    /// The user explicitly stopped trusting the device.
    UserDistrust,
}

impl RevokedReason {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rotated => "rotated",
            Self::Expired => "expired",
            Self::Logout => "logout",
            Self::TokenReuseDetected => "token_reuse_detected",
            Self::UserDistrust => "user_distrust",
        }
    }
}

impl fmt::Display for RevokedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevokedReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotated" => Ok(Self::Rotated),
            "expired" => Ok(Self::Expired),
            "logout" => Ok(Self::Logout),
            "token_reuse_detected" => Ok(Self::TokenReuseDetected),
            "user_distrust" => Ok(Self::UserDistrust),
            other => Err(UnknownVariant {
                kind: "revoked_reason",
                value: other.to_string(),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════

/// Session identity row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// User id.
    pub id: UserId,
    /// Account role.
    pub role: Role,
    /// Session epoch. Bumping it invalidates every token issued before.
    pub token_version: i64,
}

/// Single-use refresh token row.
///
/// The raw token is never stored, only its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    /// Row id.
    pub id: TokenRecordId,
    /// Owner.
    pub user_id: UserId,
    /// Digest of the raw token.
    pub token_hash: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Set when the token is consumed. A second presentation is a replay.
    pub used_at: Option<DateTime<Utc>>,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    /// Whether the token has already been consumed.
    #[must_use]
    pub const fn is_consumed(&self) -> bool {
        self.used_at.is_some()
    }

    /// Whether the token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Long-lived, rotating per-device token row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTokenRecord {
    /// Row id.
    pub id: TokenRecordId,
    /// Owner.
    pub user_id: UserId,
    /// Device the token is bound to.
    pub device_id: DeviceId,
    /// Platform the token is bound to.
    pub platform: Platform,
    /// Digest of the raw token.
    pub token_hash: String,
    /// Non-secret fragment of the raw token, for display and debugging.
    pub token_prefix: String,
    /// When the current secret was issued. Regeneration moves it forward.
    pub secret_issued_at: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Revocation time, `None` while the row is live.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Revocation reason, set together with `revoked_at`.
    pub revoked_reason: Option<RevokedReason>,
    /// Successor row after a rotation.
    pub replaced_by_token_id: Option<TokenRecordId>,
    /// Human-readable device name.
    pub device_name: Option<String>,
    /// Last user agent seen for this device.
    pub user_agent: Option<String>,
    /// Last client IP seen for this device.
    pub last_ip_address: Option<String>,
    /// Device trust score.
    pub trust_score: f64,
    /// Number of suspicious events recorded against the device.
    pub suspicious_activity_count: i32,
    /// Last successful use.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

impl DeviceTokenRecord {
    /// Whether the row is unrevoked and unexpired at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }

    /// Whether the row is past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Whether this row and `other` bind the same `(user, device, platform)`.
    #[must_use]
    pub fn same_device_as(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.device_id == other.device_id
            && self.platform == other.platform
    }
}

/// Request metadata captured by the route layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Client IP address.
    pub ip_address: Option<String>,
    /// Device name supplied at registration.
    pub device_name: Option<String>,
}

impl RequestMetadata {
    /// Metadata with only an IP address.
    #[must_use]
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip.into()),
            ..Self::default()
        }
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the device name.
    #[must_use]
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }
}

/// Usage fields written when a device token is presented or regenerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUsage {
    /// When the token was used.
    pub last_used_at: DateTime<Utc>,
    /// Client IP, if known. `None` keeps the stored value.
    pub last_ip_address: Option<String>,
    /// Client user agent, if known. `None` keeps the stored value.
    pub user_agent: Option<String>,
}

impl DeviceUsage {
    /// Usage at `now` from request metadata.
    #[must_use]
    pub fn from_metadata(now: DateTime<Utc>, metadata: &RequestMetadata) -> Self {
        Self {
            last_used_at: now,
            last_ip_address: metadata.ip_address.clone(),
            user_agent: metadata.user_agent.clone(),
        }
    }
}

/// Public view of an active device token, safe to return to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTokenSummary {
    /// Row id.
    pub id: TokenRecordId,
    /// Device the token is bound to.
    pub device_id: DeviceId,
    /// Platform the token is bound to.
    pub platform: Platform,
    /// Non-secret fragment of the token.
    pub token_prefix: String,
    /// Human-readable device name.
    pub device_name: Option<String>,
    /// Last client IP.
    pub last_ip_address: Option<String>,
    /// Last successful use.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

impl From<&DeviceTokenRecord> for DeviceTokenSummary {
    fn from(record: &DeviceTokenRecord) -> Self {
        Self {
            id: record.id.clone(),
            device_id: record.device_id.clone(),
            platform: record.platform,
            token_prefix: record.token_prefix.clone(),
            device_name: record.device_name.clone(),
            last_ip_address: record.last_ip_address.clone(),
            last_used_at: record.last_used_at,
            expires_at: record.expires_at,
            created_at: record.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_enum_round_trip_through_database_strings() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>(), Ok(platform));
        }
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
        assert_eq!(
            "token_reuse_detected".parse::<RevokedReason>(),
            Ok(RevokedReason::TokenReuseDetected)
        );
        assert!("tablet".parse::<Platform>().is_err());
    }

    #[test]
    fn test_device_token_activity_window() {
        let now = Utc::now();
        let mut record = DeviceTokenRecord {
            id: TokenRecordId::generate(),
            user_id: UserId::new("u1"),
            device_id: DeviceId::new("d1"),
            platform: Platform::Ios,
            token_hash: "hash".into(),
            token_prefix: "dt_abc".into(),
            secret_issued_at: now,
            expires_at: now + Duration::days(1),
            revoked_at: None,
            revoked_reason: None,
            replaced_by_token_id: None,
            device_name: None,
            user_agent: None,
            last_ip_address: None,
            trust_score: 1.0,
            suspicious_activity_count: 0,
            last_used_at: None,
            created_at: now,
        };

        assert!(record.is_active_at(now));
        assert!(!record.is_active_at(now + Duration::days(2)));

        record.revoked_at = Some(now);
        assert!(!record.is_active_at(now));
    }
}
