//! Token codec trait.
//!
//! Hashing and bearer-token encoding are owned by the surrounding
//! application (typically SHA-256 digests and signed JWTs). The lifecycle
//! manager only needs these four pure functions.

use crate::error::Result;
use crate::state::{DeviceId, Platform, UserId};
use serde::{Deserialize, Serialize};

/// Claims embedded in a device token.
///
/// Everything needed to check a token against the caller's context is
/// inside the token itself, so payload validation never touches the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTokenClaims {
    /// Owner.
    pub user_id: UserId,
    /// Device the token is bound to.
    pub device_id: DeviceId,
    /// Platform the token is bound to.
    pub platform: Platform,
    /// Session epoch the token was minted under.
    pub token_version: i64,
}

impl DeviceTokenClaims {
    /// Whether the claims match the given context exactly.
    #[must_use]
    pub fn matches(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        token_version: i64,
    ) -> bool {
        self.user_id == *user_id
            && self.device_id == *device_id
            && self.platform == platform
            && self.token_version == token_version
    }
}

/// Token codec.
///
/// # Implementation Notes
///
/// - All methods are called while a row lock is held, so they must be fast
///   and local (no network calls)
/// - `hash_token` must be deterministic and irreversible; its output is the
///   store lookup key
/// - `generate_device_token` must embed a unique nonce so two tokens minted
///   for the same claims never share a hash
pub trait TokenCodec: Send + Sync {
    /// Digest of a raw token, used as the store lookup key.
    fn hash_token(&self, raw: &str) -> String;

    /// Short, non-secret fragment of a raw token for display and debugging.
    fn token_prefix(&self, raw: &str) -> String;

    /// Encode a new device bearer token.
    ///
    /// # Errors
    ///
    /// Returns error if the token cannot be signed or encoded.
    fn generate_device_token(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        token_version: i64,
    ) -> Result<String>;

    /// Decode and verify a device token without touching the store.
    ///
    /// Returns `None` for malformed, forged, or otherwise unverifiable tokens.
    fn validate_device_token_payload(&self, raw: &str) -> Option<DeviceTokenClaims>;
}
