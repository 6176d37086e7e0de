//! Issuance, logout and housekeeping.
//!
//! These operations complete the lifecycle around the three core flows. Each
//! runs in its own transaction, like the core flows do.

use crate::constants::REFRESH_TOKEN_BYTES;
use crate::error::Result;
use crate::manager::TokenLifecycleManager;
use crate::outcome::{IssuedRefreshToken, SessionInvalidation};
use crate::providers::{Revocation, TokenStore, TokenTransaction};
use crate::state::{
    DeviceTokenSummary, RefreshTokenRecord, RevokedReason, TokenRecordId, UserId,
};

impl<S> TokenLifecycleManager<S>
where
    S: TokenStore,
{
    /// Issue a new single-use refresh token for a user.
    ///
    /// Only the digest is stored; the raw value in the result is the sole copy.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or the user does not exist.
    pub async fn issue_refresh_token(&self, user_id: &UserId) -> Result<IssuedRefreshToken> {
        let raw_token = generate_refresh_token();
        let now = self.now();
        let record = RefreshTokenRecord {
            id: TokenRecordId::generate(),
            user_id: user_id.clone(),
            token_hash: self.env.codec.hash_token(&raw_token),
            expires_at: now + self.env.config.refresh_token_ttl,
            used_at: None,
            created_at: now,
        };

        let mut tx = self.env.store.begin().await?;
        tx.insert_refresh_token(&record).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            refresh_token_id = %record.id,
            expires_at = %record.expires_at,
            "Refresh token issued"
        );

        Ok(IssuedRefreshToken {
            raw_token,
            id: record.id,
            expires_at: record.expires_at,
        })
    }

    /// Revoke a single device token, for logout or distrust of one device.
    ///
    /// Returns `false` if the token is unknown or already revoked.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or a lock wait times out.
    pub async fn revoke_device_token(&self, raw_token: &str, reason: RevokedReason) -> Result<bool> {
        let token_hash = self.env.codec.hash_token(raw_token);
        let mut tx = self.env.store.begin().await?;

        let Some((row, _)) = tx.lock_presented_device_token(&token_hash).await? else {
            return Ok(false);
        };
        if row.revoked_at.is_some() {
            return Ok(false);
        }

        tx.revoke_device_token(&row.id, &Revocation::new(self.now(), reason))
            .await?;
        tx.commit().await?;

        tracing::info!(
            device_token_id = %row.id,
            user_id = %row.user_id,
            reason = %reason,
            "Device token revoked"
        );
        Ok(true)
    }

    /// Log a user out everywhere.
    ///
    /// Bumps the user's session epoch and revokes every unrevoked device
    /// token with `reason`. Returns `None` for an unknown user.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or a lock wait times out.
    pub async fn invalidate_user_sessions(
        &self,
        user_id: &UserId,
        reason: RevokedReason,
    ) -> Result<Option<SessionInvalidation>> {
        let mut tx = self.env.store.begin().await?;

        if tx.lock_user(user_id).await?.is_none() {
            return Ok(None);
        }

        let new_token_version = tx.increment_token_version(user_id).await?;
        let revoked_device_tokens = tx
            .revoke_user_device_tokens(user_id, &Revocation::new(self.now(), reason))
            .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            reason = %reason,
            new_token_version,
            revoked_device_tokens,
            "User sessions invalidated"
        );

        Ok(Some(SessionInvalidation {
            new_token_version,
            revoked_device_tokens,
        }))
    }

    /// Mark every unrevoked device token past its expiry as revoked with
    /// reason `expired`. Returns the number of rows swept.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn sweep_expired_device_tokens(&self) -> Result<u64> {
        let mut tx = self.env.store.begin().await?;
        let swept = tx.sweep_expired_device_tokens(self.now()).await?;
        tx.commit().await?;

        if swept > 0 {
            tracing::info!(swept, "Expired device tokens swept");
        }
        Ok(swept)
    }

    /// Hard-delete refresh tokens consumed or expired more than `older_than`
    /// ago. Returns the number of rows deleted.
    ///
    /// Consumed rows are what make reuse detectable, so `older_than` should
    /// comfortably exceed the refresh token lifetime.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn purge_refresh_tokens(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = self.now() - older_than;

        let mut tx = self.env.store.begin().await?;
        let purged = tx.delete_refresh_tokens_before(cutoff).await?;
        tx.commit().await?;

        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "Refresh tokens purged");
        }
        Ok(purged)
    }

    /// Active device tokens of a user, most recently used first.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn list_active_device_tokens(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<DeviceTokenSummary>> {
        let mut tx = self.env.store.begin().await?;
        let rows = tx.list_active_device_tokens(user_id, self.now()).await?;
        tx.commit().await?;

        Ok(rows.iter().map(DeviceTokenSummary::from).collect())
    }
}

/// 256 random bits, base64url without padding (43 characters).
fn generate_refresh_token() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut random_bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}
