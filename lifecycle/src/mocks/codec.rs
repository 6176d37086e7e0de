//! Mock token codec for testing.
//!
//! Device tokens are `dt_<payload>.<signature>`, where the payload is the
//! base64url JSON of the claims plus a random nonce and the signature is a
//! keyed SHA-256 over the encoded payload. Enough to exercise forgery and
//! mismatch paths without pulling a JWT stack into tests.

use crate::error::Result;
use crate::providers::{DeviceTokenClaims, TokenCodec};
use crate::state::{DeviceId, Platform, UserId};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

const TOKEN_PREFIX: &str = "dt_";
const DISPLAY_PREFIX_LEN: usize = 12;

/// Mock token codec.
#[derive(Debug, Clone)]
pub struct MockTokenCodec {
    secret: Vec<u8>,
}

impl MockTokenCodec {
    /// Create a codec signing with a fixed test secret.
    #[must_use]
    pub fn new() -> Self {
        Self::with_secret(b"token-lifecycle-test-secret")
    }

    /// Create a codec signing with `secret`.
    #[must_use]
    pub fn with_secret(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Encode a device token. Infallible counterpart of
    /// [`TokenCodec::generate_device_token`] for seeding fixtures.
    #[must_use]
    pub fn mint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        token_version: i64,
    ) -> String {
        let payload = serde_json::json!({
            "user_id": user_id,
            "device_id": device_id,
            "platform": platform,
            "token_version": token_version,
            "nonce": uuid::Uuid::new_v4().to_string(),
        });
        let encoded = URL_SAFE_NO_PAD.encode(payload.to_string());
        let signature = URL_SAFE_NO_PAD.encode(self.sign(&encoded));
        format!("{TOKEN_PREFIX}{encoded}.{signature}")
    }

    fn sign(&self, encoded_payload: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(encoded_payload.as_bytes());
        hasher.finalize().into()
    }
}

impl Default for MockTokenCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCodec for MockTokenCodec {
    fn hash_token(&self, raw: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(raw.as_bytes()))
    }

    fn token_prefix(&self, raw: &str) -> String {
        raw.chars().take(DISPLAY_PREFIX_LEN).collect()
    }

    fn generate_device_token(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        token_version: i64,
    ) -> Result<String> {
        Ok(self.mint(user_id, device_id, platform, token_version))
    }

    fn validate_device_token_payload(&self, raw: &str) -> Option<DeviceTokenClaims> {
        let (encoded, signature) = raw.strip_prefix(TOKEN_PREFIX)?.split_once('.')?;

        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        if !constant_time_eq::constant_time_eq(&signature, &self.sign(encoded)) {
            return None;
        }

        let json = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        // The nonce is not a claim; serde skips it.
        serde_json::from_slice(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_token_validates() {
        let codec = MockTokenCodec::new();
        let token = codec.mint(&UserId::new("u1"), &DeviceId::new("d1"), Platform::Ios, 7);

        let claims = codec.validate_device_token_payload(&token).unwrap();

        assert!(claims.matches(&UserId::new("u1"), &DeviceId::new("d1"), Platform::Ios, 7));
    }

    #[test]
    fn test_same_claims_never_share_a_hash() {
        let codec = MockTokenCodec::new();
        let first = codec.mint(&UserId::new("u1"), &DeviceId::new("d1"), Platform::Web, 1);
        let second = codec.mint(&UserId::new("u1"), &DeviceId::new("d1"), Platform::Web, 1);

        assert_ne!(codec.hash_token(&first), codec.hash_token(&second));
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let token = MockTokenCodec::with_secret(b"attacker").mint(
            &UserId::new("u1"),
            &DeviceId::new("d1"),
            Platform::Web,
            1,
        );

        assert!(MockTokenCodec::new().validate_device_token_payload(&token).is_none());
        assert!(MockTokenCodec::new().validate_device_token_payload("garbage").is_none());
    }
}
