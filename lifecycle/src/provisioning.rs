//! Device token provisioning.
//!
//! Validates a device token presented at login or session bootstrap and
//! creates one when none is usable. Concurrent requests for the same user
//! are serialized on the user row, so a burst of logins from one device
//! converges on a single active row.
//!
//! # Concurrent Logins
//!
//! A caller without a usable token gets a fresh secret on the existing row.
//! When that row's secret was itself issued less than `grace_period` ago, the
//! superseded secret is kept as an alias of the row, so every caller in a
//! burst of simultaneous logins walks away with a token that works. Outside
//! the window the old secret is retired together with any earlier aliases.
//!
//! # Lock Ordering
//!
//! The user row is always locked before any device row, including when the
//! caller presents a token that turns out to be valid. Reuse detection takes
//! the same order (user, then the user's device rows), so the two never wait
//! on each other in opposite directions.

use crate::constants::{defaults, metric_names};
use crate::error::Result;
use crate::manager::{TokenLifecycleManager, record_failure, record_outcome};
use crate::outcome::{ProvisionOutcome, ProvisionedDeviceToken, TokenFailure};
use crate::providers::{TokenStore, TokenTransaction};
use crate::state::{
    DeviceId, DeviceTokenRecord, DeviceUsage, Platform, RequestMetadata, TokenRecordId, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller context for [`TokenLifecycleManager::validate_or_create_device_token`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Device token the client already holds, if any.
    pub provided_token: Option<String>,
    /// Authenticated user.
    pub user_id: UserId,
    /// Device the request comes from.
    pub device_id: DeviceId,
    /// Platform the request comes from.
    pub platform: Platform,
    /// Session epoch from the caller's access token.
    pub token_version: i64,
}

impl ProvisionRequest {
    /// Request without a provided token.
    #[must_use]
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        platform: Platform,
        token_version: i64,
    ) -> Self {
        Self {
            provided_token: None,
            user_id,
            device_id,
            platform,
            token_version,
        }
    }

    /// Attach the token the client already holds.
    #[must_use]
    pub fn with_provided_token(mut self, token: impl Into<String>) -> Self {
        self.provided_token = Some(token.into());
        self
    }
}

impl<S> TokenLifecycleManager<S>
where
    S: TokenStore,
{
    /// Validate the caller's device token or provision a new one.
    ///
    /// # Returns
    ///
    /// - `Ready { is_new: false }` with the provided token when it is valid
    ///   for this exact context
    /// - `Ready { is_new: false }` with a fresh secret on the existing active
    ///   row when the client's copy is missing or unusable; a secret issued
    ///   within `grace_period` stays valid as an alias
    /// - `Ready { is_new: true }` when a new row was inserted
    /// - `Rejected(InvalidToken)` when the user does not exist
    /// - `Rejected(InvalidVersion)` when `token_version` is stale
    ///
    /// # Errors
    ///
    /// Returns error if the store or codec fails, or a lock wait times out.
    pub async fn validate_or_create_device_token(
        &self,
        request: &ProvisionRequest,
        metadata: &RequestMetadata,
    ) -> Result<ProvisionOutcome> {
        let provided = match request.provided_token.as_deref() {
            Some(raw) => match self.screen_provided_token(request, raw) {
                Screened::Candidate => Some(raw),
                Screened::StaleVersion => return Ok(reject(TokenFailure::InvalidVersion)),
                Screened::Unusable => None,
            },
            None => None,
        };

        let mut tx = self.env.store.begin().await?;

        let Some(user) = tx.lock_user(&request.user_id).await? else {
            tracing::warn!(user_id = %request.user_id, "Provisioning for unknown user");
            return Ok(reject(TokenFailure::InvalidToken));
        };

        if user.token_version != request.token_version {
            tracing::warn!(
                user_id = %user.id,
                claimed_version = request.token_version,
                current_version = user.token_version,
                "Provisioning with stale token version"
            );
            return Ok(reject(TokenFailure::InvalidVersion));
        }

        if let Some(raw) = provided {
            if let Some(outcome) = self.reuse_provided_token(&mut tx, request, raw, metadata).await? {
                tx.commit().await?;
                return Ok(outcome);
            }
        }

        let now = self.now();
        let new_token = self.env.codec.generate_device_token(
            &request.user_id,
            &request.device_id,
            request.platform,
            user.token_version,
        )?;
        let token_hash = self.env.codec.hash_token(&new_token);
        let token_prefix = self.env.codec.token_prefix(&new_token);

        let existing = tx
            .lock_active_device_token(&request.user_id, &request.device_id, request.platform, now)
            .await?;

        if let Some(existing) = existing {
            let kept_alias = now - existing.secret_issued_at < self.env.config.grace_period;
            if kept_alias {
                tx.insert_device_token_alias(&existing.token_hash, &existing.id, now)
                    .await?;
            } else {
                tx.delete_device_token_aliases(&existing.id).await?;
            }
            tx.replace_device_token_secret(
                &existing.id,
                &token_hash,
                &token_prefix,
                &DeviceUsage::from_metadata(now, metadata),
            )
            .await?;
            tx.commit().await?;

            tracing::info!(
                device_token_id = %existing.id,
                user_id = %request.user_id,
                device_id = %request.device_id,
                platform = %request.platform,
                kept_alias,
                "Device token secret regenerated"
            );
            record_outcome(metric_names::PROVISION_TOTAL, "regenerated");

            return Ok(ProvisionOutcome::Ready(ProvisionedDeviceToken {
                device_token: new_token,
                device_token_record_id: existing.id,
                is_new: false,
            }));
        }

        let superseded = tx
            .revoke_expired_device_tokens(
                &request.user_id,
                &request.device_id,
                request.platform,
                now,
            )
            .await?;

        let record = self.new_device_record(request, token_hash, token_prefix, metadata, now);
        tx.insert_device_token(&record).await?;
        tx.commit().await?;

        tracing::info!(
            device_token_id = %record.id,
            user_id = %record.user_id,
            device_id = %record.device_id,
            platform = %record.platform,
            superseded_expired = superseded,
            "Device token created"
        );
        record_outcome(metric_names::PROVISION_TOTAL, "created");

        Ok(ProvisionOutcome::Ready(ProvisionedDeviceToken {
            device_token: new_token,
            device_token_record_id: record.id,
            is_new: true,
        }))
    }

    /// Check a provided token's payload against the request without touching
    /// the store.
    fn screen_provided_token(&self, request: &ProvisionRequest, raw: &str) -> Screened {
        let Some(claims) = self.env.codec.validate_device_token_payload(raw) else {
            tracing::debug!(user_id = %request.user_id, "Provided device token failed verification");
            return Screened::Unusable;
        };

        if claims.user_id != request.user_id
            || claims.device_id != request.device_id
            || claims.platform != request.platform
        {
            tracing::debug!(
                user_id = %request.user_id,
                device_id = %request.device_id,
                "Provided device token is bound to another device"
            );
            return Screened::Unusable;
        }

        if claims.token_version != request.token_version {
            tracing::warn!(
                user_id = %request.user_id,
                token_version = claims.token_version,
                claimed_version = request.token_version,
                "Provided device token predates current session"
            );
            return Screened::StaleVersion;
        }

        Screened::Candidate
    }

    /// Lock the provided token's row and accept it if it is the live row for
    /// this device. Called with the user row already locked.
    async fn reuse_provided_token(
        &self,
        tx: &mut S::Transaction,
        request: &ProvisionRequest,
        raw: &str,
        metadata: &RequestMetadata,
    ) -> Result<Option<ProvisionOutcome>> {
        let token_hash = self.env.codec.hash_token(raw);
        let Some((row, _)) = tx.lock_presented_device_token(&token_hash).await? else {
            return Ok(None);
        };

        let now = self.now();
        let bound_here = row.is_active_at(now)
            && row.user_id == request.user_id
            && row.device_id == request.device_id
            && row.platform == request.platform;
        if !bound_here {
            tracing::debug!(device_token_id = %row.id, "Provided device token is not live");
            return Ok(None);
        }

        tx.touch_device_token(&row.id, &DeviceUsage::from_metadata(now, metadata))
            .await?;

        tracing::debug!(device_token_id = %row.id, "Provided device token accepted");
        record_outcome(metric_names::PROVISION_TOTAL, "reused");

        Ok(Some(ProvisionOutcome::Ready(ProvisionedDeviceToken {
            device_token: raw.to_string(),
            device_token_record_id: row.id,
            is_new: false,
        })))
    }

    fn new_device_record(
        &self,
        request: &ProvisionRequest,
        token_hash: String,
        token_prefix: String,
        metadata: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> DeviceTokenRecord {
        DeviceTokenRecord {
            id: TokenRecordId::generate(),
            user_id: request.user_id.clone(),
            device_id: request.device_id.clone(),
            platform: request.platform,
            token_hash,
            token_prefix,
            secret_issued_at: now,
            expires_at: now + self.env.config.device_token_ttl,
            revoked_at: None,
            revoked_reason: None,
            replaced_by_token_id: None,
            device_name: metadata.device_name.clone(),
            user_agent: metadata.user_agent.clone(),
            last_ip_address: metadata.ip_address.clone(),
            trust_score: defaults::INITIAL_TRUST_SCORE,
            suspicious_activity_count: 0,
            last_used_at: Some(now),
            created_at: now,
        }
    }
}

enum Screened {
    Candidate,
    StaleVersion,
    Unusable,
}

fn reject(failure: TokenFailure) -> ProvisionOutcome {
    ProvisionOutcome::Rejected(record_failure(metric_names::PROVISION_TOTAL, failure))
}
