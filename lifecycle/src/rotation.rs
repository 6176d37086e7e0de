//! Device token rotation.
//!
//! Rotation revokes the presented row and inserts a successor inside one
//! transaction. Clients on flaky networks often resend a rotation request
//! after the first one already succeeded; those duplicates arrive holding a
//! token that was just revoked as `rotated`. For `grace_period` after the
//! revocation they are answered with [`RotationOutcome::GracePeriodRetry`]
//! instead of a failure, and no second successor is ever minted.

use crate::constants::metric_names;
use crate::error::Result;
use crate::manager::{TokenLifecycleManager, record_failure, record_outcome};
use crate::outcome::{RotationOutcome, TokenFailure};
use crate::providers::{Revocation, TokenStore, TokenTransaction};
use crate::state::{DeviceTokenRecord, RequestMetadata, RevokedReason, TokenRecordId};
use chrono::{DateTime, Utc};

impl<S> TokenLifecycleManager<S>
where
    S: TokenStore,
{
    /// Rotate a device token.
    ///
    /// `metadata` overrides the device name, user agent and IP address
    /// carried over to the successor row when present.
    ///
    /// # Returns
    ///
    /// - `Rotated`: first rotation; the old row is revoked and `new_token`
    ///   is the only copy of the successor's secret
    /// - `GracePeriodRetry`: the token was rotated less than `grace_period`
    ///   ago and its successor is still active
    /// - `Rejected(AlreadyRotated)`: rotated, but outside the grace period
    ///   or the successor is gone
    /// - `Rejected(Revoked)`: revoked for any other reason
    /// - `Rejected(Expired)`: past its expiry
    /// - `Rejected(InvalidToken)`: unknown, or the payload does not verify
    ///   against the row
    /// - `Rejected(InvalidVersion)`: minted under an older session epoch
    ///
    /// # Errors
    ///
    /// Returns error if the store or codec fails, or a lock wait times out.
    /// Nothing is committed in that case.
    pub async fn rotate_device_token(
        &self,
        raw_token: &str,
        metadata: &RequestMetadata,
    ) -> Result<RotationOutcome> {
        let token_hash = self.env.codec.hash_token(raw_token);
        let mut tx = self.env.store.begin().await?;

        let Some((current, user)) = tx.lock_presented_device_token(&token_hash).await? else {
            tracing::warn!("Device token not found");
            return Ok(reject(TokenFailure::InvalidToken));
        };

        let now = self.now();

        if let Some(revoked_at) = current.revoked_at {
            return self.classify_revoked(&mut tx, &current, revoked_at, now).await;
        }

        if current.is_expired_at(now) {
            tracing::warn!(
                device_token_id = %current.id,
                user_id = %current.user_id,
                expires_at = %current.expires_at,
                "Device token expired"
            );
            return Ok(reject(TokenFailure::Expired));
        }

        let Some(claims) = self.env.codec.validate_device_token_payload(raw_token) else {
            tracing::warn!(
                device_token_id = %current.id,
                "Device token payload failed verification"
            );
            return Ok(reject(TokenFailure::InvalidToken));
        };

        if claims.user_id != current.user_id
            || claims.device_id != current.device_id
            || claims.platform != current.platform
        {
            tracing::warn!(
                device_token_id = %current.id,
                claimed_user_id = %claims.user_id,
                claimed_device_id = %claims.device_id,
                "Device token payload does not match its row"
            );
            return Ok(reject(TokenFailure::InvalidToken));
        }

        if claims.token_version != user.token_version {
            tracing::warn!(
                device_token_id = %current.id,
                user_id = %user.id,
                claimed_version = claims.token_version,
                current_version = user.token_version,
                "Device token version mismatch"
            );
            return Ok(reject(TokenFailure::InvalidVersion));
        }

        let new_token = self.env.codec.generate_device_token(
            &current.user_id,
            &current.device_id,
            current.platform,
            user.token_version,
        )?;
        let successor = self.successor_record(&current, &new_token, metadata, now);

        // Revoke first: the partial unique index admits one live row per device.
        tx.revoke_device_token(&current.id, &Revocation::rotated(now, successor.id.clone()))
            .await?;
        tx.insert_device_token(&successor).await?;
        tx.commit().await?;

        tracing::info!(
            old_device_token_id = %current.id,
            new_device_token_id = %successor.id,
            user_id = %successor.user_id,
            device_id = %successor.device_id,
            platform = %successor.platform,
            "Device token rotated"
        );
        record_outcome(metric_names::ROTATION_TOTAL, "success");

        Ok(RotationOutcome::Rotated {
            new_token,
            device_token_id: successor.id,
            user_id: successor.user_id,
            device_id: successor.device_id,
            platform: successor.platform,
        })
    }

    /// Decide what a revoked row means for the caller.
    ///
    /// Only a `rotated` row with a successor can qualify for the grace
    /// period. The window is strict: a retry exactly `grace_period` after the
    /// revocation is refused.
    async fn classify_revoked(
        &self,
        tx: &mut S::Transaction,
        current: &DeviceTokenRecord,
        revoked_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome> {
        let successor_id = match (current.revoked_reason, &current.replaced_by_token_id) {
            (Some(RevokedReason::Rotated), Some(successor_id)) => successor_id,
            (reason, _) => {
                tracing::warn!(
                    device_token_id = %current.id,
                    user_id = %current.user_id,
                    reason = ?reason,
                    "Revoked device token presented"
                );
                return Ok(reject(TokenFailure::Revoked));
            }
        };

        if now - revoked_at < self.env.config.grace_period {
            let successor = tx.find_device_token(successor_id).await?;
            if let Some(successor) = successor.filter(|s| s.is_active_at(now)) {
                tracing::info!(
                    device_token_id = %current.id,
                    successor_id = %successor.id,
                    revoked_at = %revoked_at,
                    "Device token rotation retry within grace period"
                );
                record_outcome(metric_names::ROTATION_TOTAL, "grace_period_retry");
                return Ok(RotationOutcome::GracePeriodRetry {
                    device_token_id: successor.id,
                    user_id: successor.user_id,
                    device_id: successor.device_id,
                    platform: successor.platform,
                });
            }
        }

        tracing::warn!(
            device_token_id = %current.id,
            user_id = %current.user_id,
            revoked_at = %revoked_at,
            "Rotated device token presented outside grace period"
        );
        Ok(reject(TokenFailure::AlreadyRotated))
    }

    fn successor_record(
        &self,
        current: &DeviceTokenRecord,
        new_token: &str,
        metadata: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> DeviceTokenRecord {
        DeviceTokenRecord {
            id: TokenRecordId::generate(),
            user_id: current.user_id.clone(),
            device_id: current.device_id.clone(),
            platform: current.platform,
            token_hash: self.env.codec.hash_token(new_token),
            token_prefix: self.env.codec.token_prefix(new_token),
            secret_issued_at: now,
            expires_at: now + self.env.config.device_token_ttl,
            revoked_at: None,
            revoked_reason: None,
            replaced_by_token_id: None,
            device_name: metadata
                .device_name
                .clone()
                .or_else(|| current.device_name.clone()),
            user_agent: metadata
                .user_agent
                .clone()
                .or_else(|| current.user_agent.clone()),
            last_ip_address: metadata
                .ip_address
                .clone()
                .or_else(|| current.last_ip_address.clone()),
            trust_score: current.trust_score,
            suspicious_activity_count: current.suspicious_activity_count,
            last_used_at: Some(now),
            created_at: now,
        }
    }
}

fn reject(failure: TokenFailure) -> RotationOutcome {
    RotationOutcome::Rejected(record_failure(metric_names::ROTATION_TOTAL, failure))
}

#[cfg(all(test, feature = "test-utils"))]
mod tests {
    use crate::mocks::{InMemoryTokenStore, fixture};
    use crate::outcome::{RotationOutcome, TokenFailure};
    use crate::providers::TokenCodec;
    use crate::state::{DeviceId, Platform, RequestMetadata, RevokedReason, Role, UserId};
    use chrono::Duration;

    #[tokio::test]
    async fn test_successor_carries_device_history() {
        let fx = fixture(InMemoryTokenStore::new());
        let user = UserId::new("u1");
        fx.store.insert_user(&user, Role::User, 1);
        let raw = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Desktop, 1);
        fx.store.update_device_token_by_hash(&fx.codec.hash_token(&raw), |row| {
            row.device_name = Some("Work laptop".into());
            row.trust_score = 0.4;
            row.suspicious_activity_count = 2;
        });

        let outcome = fx
            .manager
            .rotate_device_token(&raw, &RequestMetadata::from_ip("198.51.100.4"))
            .await
            .unwrap();

        let new_id = outcome.device_token_id().cloned().unwrap();
        let successor = fx.store.device_token(&new_id).unwrap();
        assert_eq!(successor.device_name.as_deref(), Some("Work laptop"));
        assert_eq!(successor.last_ip_address.as_deref(), Some("198.51.100.4"));
        assert!((successor.trust_score - 0.4).abs() < f64::EPSILON);
        assert_eq!(successor.suspicious_activity_count, 2);
        assert_eq!(
            successor.expires_at,
            fx.clock.current() + fx.manager.environment().config.device_token_ttl
        );
    }

    #[tokio::test]
    async fn test_grace_window_is_strict() {
        let fx = fixture(InMemoryTokenStore::new());
        let user = UserId::new("u1");
        fx.store.insert_user(&user, Role::User, 1);
        let raw = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Ios, 1);
        let metadata = RequestMetadata::default();

        assert!(fx.manager.rotate_device_token(&raw, &metadata).await.unwrap().new_token().is_some());

        fx.clock.advance(fx.manager.environment().config.grace_period - Duration::milliseconds(1));
        let inside = fx.manager.rotate_device_token(&raw, &metadata).await.unwrap();
        assert!(inside.is_grace_period_retry());

        fx.clock.advance(Duration::milliseconds(1));
        let boundary = fx.manager.rotate_device_token(&raw, &metadata).await.unwrap();
        assert_eq!(boundary, RotationOutcome::Rejected(TokenFailure::AlreadyRotated));
    }

    #[tokio::test]
    async fn test_logout_revocation_is_not_retryable() {
        let fx = fixture(InMemoryTokenStore::new());
        let user = UserId::new("u1");
        fx.store.insert_user(&user, Role::User, 1);
        let raw = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Web, 1);

        assert!(fx.manager.revoke_device_token(&raw, RevokedReason::Logout).await.unwrap());
        let outcome = fx
            .manager
            .rotate_device_token(&raw, &RequestMetadata::default())
            .await
            .unwrap();

        assert_eq!(outcome, RotationOutcome::Rejected(TokenFailure::Revoked));
    }

    #[tokio::test]
    async fn test_stale_epoch_is_rejected_without_side_effects() {
        let fx = fixture(InMemoryTokenStore::new());
        let user = UserId::new("u1");
        fx.store.insert_user(&user, Role::User, 1);
        let raw = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Android, 1);
        fx.store.set_token_version(&user, 2);

        let outcome = fx
            .manager
            .rotate_device_token(&raw, &RequestMetadata::default())
            .await
            .unwrap();

        assert_eq!(outcome, RotationOutcome::Rejected(TokenFailure::InvalidVersion));
        assert_eq!(fx.store.device_tokens().len(), 1);
        assert!(fx.store.device_tokens()[0].revoked_at.is_none());
    }

    #[tokio::test]
    async fn test_forged_payload_is_invalid() {
        let fx = fixture(InMemoryTokenStore::new());
        let user = UserId::new("u1");
        fx.store.insert_user(&user, Role::User, 1);
        let raw = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Web, 1);

        // Keep the row but make the presented secret unverifiable.
        let forged = format!("{raw}x");
        fx.store.update_device_token_by_hash(&fx.codec.hash_token(&raw), |row| {
            row.token_hash = fx.codec.hash_token(&forged);
        });

        let outcome = fx
            .manager
            .rotate_device_token(&forged, &RequestMetadata::default())
            .await
            .unwrap();

        assert_eq!(outcome, RotationOutcome::Rejected(TokenFailure::InvalidToken));
    }
}
