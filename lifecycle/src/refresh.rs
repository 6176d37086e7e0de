//! Refresh token consumption.
//!
//! Refresh tokens are single-use. Consuming one sets `used_at` instead of
//! deleting the row, so a second presentation of the same token can be told
//! apart from a token that never existed. A second presentation means the
//! token leaked: every session of the owner is invalidated in the same
//! transaction that observed the replay.
//!
//! The row lock is taken without waiting. A duplicate request that arrives
//! while the first one is still in flight finds the row busy and is turned
//! away as `invalid_token`; it never waits for the first commit and then
//! mistakes the client's own double submit for a replay.

use crate::constants::metric_names;
use crate::error::Result;
use crate::manager::{TokenLifecycleManager, record_failure, record_outcome};
use crate::outcome::{RefreshOutcome, TokenFailure};
use crate::providers::{Revocation, RowLock, TokenStore, TokenTransaction};
use crate::state::RevokedReason;

impl<S> TokenLifecycleManager<S>
where
    S: TokenStore,
{
    /// Validate and consume a refresh token.
    ///
    /// `jwt_token_version` is the session epoch embedded in the caller's
    /// access token, when one is available. Tokens minted before an epoch
    /// bump never refresh.
    ///
    /// # Returns
    ///
    /// - `Refreshed`: the token was valid and is now consumed
    /// - `Rejected(InvalidToken)`: no row has this hash, or another request
    ///   is consuming the same token right now
    /// - `Rejected(TokenReuse)`: the token was already consumed; the owner's
    ///   `token_version` was bumped and all of their device tokens revoked
    /// - `Rejected(Expired)`: the token is past its expiry
    /// - `Rejected(InvalidVersion)`: `jwt_token_version` is stale
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or a lock wait times out. Nothing is
    /// committed in that case and the call may be retried.
    pub async fn consume_refresh_token(
        &self,
        raw_token: &str,
        jwt_token_version: Option<i64>,
    ) -> Result<RefreshOutcome> {
        let token_hash = self.env.codec.hash_token(raw_token);
        let mut tx = self.env.store.begin().await?;

        let (token, user) = match tx.try_lock_refresh_token(&token_hash).await? {
            RowLock::Acquired(found) => found,
            RowLock::Busy => {
                tracing::warn!("Refresh token already being consumed by a concurrent request");
                return Ok(reject(TokenFailure::InvalidToken));
            }
            RowLock::NotFound => {
                tracing::warn!("Refresh token not found");
                return Ok(reject(TokenFailure::InvalidToken));
            }
        };

        // Read after the lock is granted; the wait may have been long.
        let now = self.now();

        if token.is_consumed() {
            let new_version = tx.increment_token_version(&user.id).await?;
            let revoked = tx
                .revoke_user_device_tokens(
                    &user.id,
                    &Revocation::new(now, RevokedReason::TokenReuseDetected),
                )
                .await?;
            tx.commit().await?;

            tracing::error!(
                user_id = %user.id,
                refresh_token_id = %token.id,
                first_used_at = ?token.used_at,
                new_token_version = new_version,
                revoked_device_tokens = revoked,
                "Refresh token reuse detected, all sessions invalidated"
            );
            return Ok(reject(TokenFailure::TokenReuse));
        }

        if token.is_expired_at(now) {
            tracing::warn!(
                user_id = %user.id,
                refresh_token_id = %token.id,
                expires_at = %token.expires_at,
                "Refresh token expired"
            );
            return Ok(reject(TokenFailure::Expired));
        }

        if let Some(claimed) = jwt_token_version {
            if claimed != user.token_version {
                tracing::warn!(
                    user_id = %user.id,
                    refresh_token_id = %token.id,
                    claimed_version = claimed,
                    current_version = user.token_version,
                    "Refresh token version mismatch"
                );
                return Ok(reject(TokenFailure::InvalidVersion));
            }
        }

        tx.mark_refresh_token_used(&token.id, now).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user.id,
            refresh_token_id = %token.id,
            token_version = user.token_version,
            "Refresh token consumed"
        );
        record_outcome(metric_names::REFRESH_TOTAL, "success");

        Ok(RefreshOutcome::Refreshed {
            user_id: user.id,
            token_version: user.token_version,
            role: user.role,
        })
    }
}

fn reject(failure: TokenFailure) -> RefreshOutcome {
    RefreshOutcome::Rejected(record_failure(metric_names::REFRESH_TOTAL, failure))
}
