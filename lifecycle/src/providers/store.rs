//! Transactional token store traits.
//!
//! Every lifecycle operation runs inside exactly one [`TokenTransaction`].
//! Methods named `lock_*` take a row-level exclusive lock (`SELECT ... FOR
//! UPDATE`) that is held until the transaction commits or is dropped.
//! Methods named `try_lock_*` never wait: a row held by another transaction
//! is reported as [`RowLock::Busy`] (`FOR UPDATE SKIP LOCKED`).
//!
//! # Security Requirements
//!
//! 1. **Row locks, not process locks**: implementations must rely on the
//!    store's own locking so correctness holds across service instances
//! 2. **All-or-nothing**: dropping a transaction without calling
//!    [`TokenTransaction::commit`] must discard every write made through it
//! 3. **Bounded waits**: lock waits and statements must be bounded by the
//!    configured timeouts and surface as [`crate::LifecycleError::LockTimeout`]
//!    or [`crate::LifecycleError::StatementTimeout`]
//! 4. **One live device token**: at most one unrevoked row may exist per
//!    `(user_id, device_id, platform)`; an insert that would break this must
//!    fail with [`crate::LifecycleError::UniqueViolation`]

use crate::error::Result;
use crate::state::{
    DeviceId, DeviceTokenRecord, DeviceUsage, Platform, RefreshTokenRecord, RevokedReason,
    TokenRecordId, UserId, UserRecord,
};
use chrono::{DateTime, Utc};
use std::future::Future;

/// Revocation written to a device token row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    /// Revocation time.
    pub at: DateTime<Utc>,
    /// Why the row was revoked.
    pub reason: RevokedReason,
    /// Successor row, set only for rotations.
    pub replaced_by: Option<TokenRecordId>,
}

impl Revocation {
    /// Revocation without a successor.
    #[must_use]
    pub const fn new(at: DateTime<Utc>, reason: RevokedReason) -> Self {
        Self {
            at,
            reason,
            replaced_by: None,
        }
    }

    /// Rotation revocation pointing at the successor row.
    #[must_use]
    pub const fn rotated(at: DateTime<Utc>, successor: TokenRecordId) -> Self {
        Self {
            at,
            reason: RevokedReason::Rotated,
            replaced_by: Some(successor),
        }
    }
}

/// Result of a non-blocking row lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowLock<T> {
    /// The row exists and is now locked by this transaction.
    Acquired(T),
    /// The row exists but another transaction holds it.
    Busy,
    /// No row matched.
    NotFound,
}

impl<T> RowLock<T> {
    /// The locked row, if the lock was acquired.
    #[must_use]
    pub fn acquired(self) -> Option<T> {
        match self {
            Self::Acquired(row) => Some(row),
            Self::Busy | Self::NotFound => None,
        }
    }
}

/// Token store.
///
/// Opens transactions against the `users`, `refresh_tokens` and
/// `device_tokens` tables.
pub trait TokenStore: Send + Sync {
    /// Transaction handle produced by [`TokenStore::begin`].
    type Transaction: TokenTransaction;

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No connection could be acquired
    /// - The timeouts could not be applied to the transaction
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction>> + Send;
}

/// A single store transaction.
///
/// Dropping the handle without committing rolls every write back.
pub trait TokenTransaction: Send + Sized {
    // ═══════════════════════════════════════════════════════════
    // Users
    // ═══════════════════════════════════════════════════════════

    /// Lock a user row.
    ///
    /// Used to serialize device token creation for one user.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the lock wait times out.
    fn lock_user(
        &mut self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Option<UserRecord>>> + Send;

    /// Increment a user's `token_version`, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the user does not exist.
    fn increment_token_version(
        &mut self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<i64>> + Send;

    // ═══════════════════════════════════════════════════════════
    // Refresh Tokens
    // ═══════════════════════════════════════════════════════════

    /// Insert a refresh token row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the hash already exists.
    fn insert_refresh_token(
        &mut self,
        record: &RefreshTokenRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Lock a refresh token row by hash, joined to its owner, without
    /// waiting for a transaction that already holds it.
    ///
    /// Only the token row is locked; the user row is read without a lock.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn try_lock_refresh_token(
        &mut self,
        token_hash: &str,
    ) -> impl Future<Output = Result<RowLock<(RefreshTokenRecord, UserRecord)>>> + Send;

    /// Mark a refresh token consumed.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn mark_refresh_token_used(
        &mut self,
        id: &TokenRecordId,
        used_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Hard-delete refresh tokens consumed or expired before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn delete_refresh_tokens_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;

    // ═══════════════════════════════════════════════════════════
    // Device Tokens
    // ═══════════════════════════════════════════════════════════

    /// Insert a device token row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails, the hash already exists, or another
    /// unrevoked row exists for the same device.
    fn insert_device_token(
        &mut self,
        record: &DeviceTokenRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Lock a device token row by hash, joined to its owner, whatever its
    /// revocation state.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the lock wait times out.
    fn lock_device_token(
        &mut self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<(DeviceTokenRecord, UserRecord)>>> + Send;

    /// Lock the device token row a superseded secret still resolves to,
    /// joined to its owner.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the lock wait times out.
    fn lock_aliased_device_token(
        &mut self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<(DeviceTokenRecord, UserRecord)>>> + Send;

    /// Lock the row a presented device token resolves to: by its current
    /// secret first, then by a superseded one.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the lock wait times out.
    fn lock_presented_device_token(
        &mut self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<(DeviceTokenRecord, UserRecord)>>> + Send {
        async move {
            if let Some(found) = self.lock_device_token(token_hash).await? {
                return Ok(Some(found));
            }
            self.lock_aliased_device_token(token_hash).await
        }
    }

    /// Keep a superseded secret resolvable to its row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the hash is already an alias.
    fn insert_device_token_alias(
        &mut self,
        token_hash: &str,
        id: &TokenRecordId,
        created_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Forget every superseded secret of a row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn delete_device_token_aliases(
        &mut self,
        id: &TokenRecordId,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Read a device token row by id, without locking it.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn find_device_token(
        &mut self,
        id: &TokenRecordId,
    ) -> impl Future<Output = Result<Option<DeviceTokenRecord>>> + Send;

    /// Lock the active row for a `(user, device, platform)` tuple.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the lock wait times out.
    fn lock_active_device_token(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<DeviceTokenRecord>>> + Send;

    /// Revoke one device token row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn revoke_device_token(
        &mut self,
        id: &TokenRecordId,
        revocation: &Revocation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Revoke unrevoked rows for a tuple whose expiry is at or before `now`,
    /// with reason `expired`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn revoke_expired_device_tokens(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Revoke every unrevoked device token of a user.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn revoke_user_device_tokens(
        &mut self,
        user_id: &UserId,
        revocation: &Revocation,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Revoke every unrevoked device token past its expiry, with reason
    /// `expired`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn sweep_expired_device_tokens(
        &mut self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Replace the secret of an existing row in place and record usage.
    ///
    /// `secret_issued_at` moves to `usage.last_used_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the new hash already exists.
    fn replace_device_token_secret(
        &mut self,
        id: &TokenRecordId,
        token_hash: &str,
        token_prefix: &str,
        usage: &DeviceUsage,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Record usage of a device token.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn touch_device_token(
        &mut self,
        id: &TokenRecordId,
        usage: &DeviceUsage,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Active device tokens of a user, most recently used first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn list_active_device_tokens(
        &mut self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<DeviceTokenRecord>>> + Send;

    // ═══════════════════════════════════════════════════════════
    // Completion
    // ═══════════════════════════════════════════════════════════

    /// Commit every write made through this transaction and release its locks.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails; nothing is persisted in that case.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}
