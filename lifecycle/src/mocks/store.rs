//! In-memory token store for testing.

use crate::constants::defaults;
use crate::error::{LifecycleError, Result};
use crate::providers::{Revocation, RowLock, TokenStore, TokenTransaction};
use crate::state::{
    DeviceId, DeviceTokenRecord, DeviceUsage, Platform, RefreshTokenRecord, RevokedReason, Role,
    TokenRecordId, UserId, UserRecord,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Default)]
struct StoreState {
    users: HashMap<UserId, UserRecord>,
    refresh_tokens: Vec<RefreshTokenRecord>,
    device_tokens: Vec<DeviceTokenRecord>,
    device_token_aliases: HashMap<String, TokenRecordId>,
}

/// In-memory token store.
///
/// A transaction works on a private copy of the tables and publishes it on
/// commit. Transactions are serialized as a whole from their first table
/// access, which waits for the running transaction to finish, bounded by the
/// lock timeout. That is coarser than row locks but gives the same
/// isolation, and it enforces the same constraints as the SQL schema (unique
/// hashes, one unrevoked row per device, owners must exist).
///
/// A refresh token row locked by the running transaction is reported as
/// [`RowLock::Busy`] to a transaction that has not started waiting yet, the
/// way `SKIP LOCKED` reports it.
#[derive(Debug, Clone)]
pub struct InMemoryTokenStore {
    state: Arc<Mutex<StoreState>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    held_refresh_rows: Arc<Mutex<HashSet<String>>>,
    lock_timeout: Duration,
}

impl InMemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            held_refresh_rows: Arc::new(Mutex::new(HashSet::new())),
            lock_timeout: Duration::from_millis(defaults::LOCK_TIMEOUT_MS),
        }
    }

    /// Set how long a transaction waits for the running one.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    fn tables(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn held_refresh_rows(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held_refresh_rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ═══════════════════════════════════════════════════════════
    // Seeding and inspection
    // ═══════════════════════════════════════════════════════════

    /// Insert or replace a user.
    pub fn insert_user(&self, user_id: &UserId, role: Role, token_version: i64) {
        self.tables().users.insert(
            user_id.clone(),
            UserRecord {
                id: user_id.clone(),
                role,
                token_version,
            },
        );
    }

    /// Overwrite a user's session epoch, as an external logout would.
    pub fn set_token_version(&self, user_id: &UserId, token_version: i64) {
        if let Some(user) = self.tables().users.get_mut(user_id) {
            user.token_version = token_version;
        }
    }

    /// Current state of a user.
    #[must_use]
    pub fn user(&self, user_id: &UserId) -> Option<UserRecord> {
        self.tables().users.get(user_id).cloned()
    }

    /// Insert a device token row without constraint checks.
    pub fn put_device_token(&self, record: DeviceTokenRecord) {
        self.tables().device_tokens.push(record);
    }

    /// Apply `update` to the device token row with this hash.
    ///
    /// Returns `false` if no row has the hash.
    pub fn update_device_token_by_hash(
        &self,
        token_hash: &str,
        update: impl FnOnce(&mut DeviceTokenRecord),
    ) -> bool {
        let mut tables = self.tables();
        match tables
            .device_tokens
            .iter_mut()
            .find(|row| row.token_hash == token_hash)
        {
            Some(row) => {
                update(row);
                true
            }
            None => false,
        }
    }

    /// All device token rows, in insertion order.
    #[must_use]
    pub fn device_tokens(&self) -> Vec<DeviceTokenRecord> {
        self.tables().device_tokens.clone()
    }

    /// One device token row.
    #[must_use]
    pub fn device_token(&self, id: &TokenRecordId) -> Option<DeviceTokenRecord> {
        self.tables()
            .device_tokens
            .iter()
            .find(|row| row.id == *id)
            .cloned()
    }

    /// Superseded secrets that still resolve to a device token row.
    #[must_use]
    pub fn device_token_aliases(&self, id: &TokenRecordId) -> Vec<String> {
        self.tables()
            .device_token_aliases
            .iter()
            .filter(|(_, target)| *target == id)
            .map(|(hash, _)| hash.clone())
            .collect()
    }

    /// All refresh token rows, in insertion order.
    #[must_use]
    pub fn refresh_tokens(&self) -> Vec<RefreshTokenRecord> {
        self.tables().refresh_tokens.clone()
    }

    /// One refresh token row.
    #[must_use]
    pub fn refresh_token(&self, id: &TokenRecordId) -> Option<RefreshTokenRecord> {
        self.tables()
            .refresh_tokens
            .iter()
            .find(|row| row.id == *id)
            .cloned()
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for InMemoryTokenStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            store: self.clone(),
            guard: None,
            working: StoreState::default(),
            held_refresh_row: None,
        })
    }
}

/// Transaction over an [`InMemoryTokenStore`].
///
/// Dropping it discards the working copy.
#[derive(Debug)]
pub struct InMemoryTransaction {
    store: InMemoryTokenStore,
    guard: Option<OwnedMutexGuard<()>>,
    working: StoreState,
    held_refresh_row: Option<String>,
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if let Some(token_hash) = self.held_refresh_row.take() {
            self.store.held_refresh_rows().remove(&token_hash);
        }
    }
}

impl InMemoryTransaction {
    /// Wait for the running transaction, then take a private copy of the
    /// tables. No-op once acquired.
    async fn acquire(&mut self) -> Result<()> {
        if self.guard.is_some() {
            return Ok(());
        }

        let guard = tokio::time::timeout(
            self.store.lock_timeout,
            Arc::clone(&self.store.gate).lock_owned(),
        )
        .await
        .map_err(|_| LifecycleError::LockTimeout)?;

        self.working = self
            .store
            .state
            .lock()
            .map_err(|_| LifecycleError::Internal("Mutex lock failed".to_string()))?
            .clone();
        self.guard = Some(guard);
        Ok(())
    }

    fn user_exists(&self, user_id: &UserId) -> Result<()> {
        if self.working.users.contains_key(user_id) {
            Ok(())
        } else {
            Err(LifecycleError::Database(format!(
                "foreign key violation: user {user_id} does not exist"
            )))
        }
    }

    fn device_hash_taken(&self, token_hash: &str, except: Option<&TokenRecordId>) -> bool {
        self.working
            .device_tokens
            .iter()
            .any(|row| row.token_hash == token_hash && Some(&row.id) != except)
    }

    fn device_row_mut(&mut self, id: &TokenRecordId) -> Option<&mut DeviceTokenRecord> {
        self.working.device_tokens.iter_mut().find(|row| row.id == *id)
    }

    fn joined_user(&self, user_id: &UserId) -> Option<UserRecord> {
        self.working.users.get(user_id).cloned()
    }
}

fn apply_usage(row: &mut DeviceTokenRecord, usage: &DeviceUsage) {
    row.last_used_at = Some(usage.last_used_at);
    if let Some(ip) = &usage.last_ip_address {
        row.last_ip_address = Some(ip.clone());
    }
    if let Some(user_agent) = &usage.user_agent {
        row.user_agent = Some(user_agent.clone());
    }
}

fn apply_revocation(row: &mut DeviceTokenRecord, revocation: &Revocation) {
    row.revoked_at = Some(revocation.at);
    row.revoked_reason = Some(revocation.reason);
    row.replaced_by_token_id.clone_from(&revocation.replaced_by);
}

impl TokenTransaction for InMemoryTransaction {
    async fn lock_user(&mut self, user_id: &UserId) -> Result<Option<UserRecord>> {
        self.acquire().await?;
        Ok(self.joined_user(user_id))
    }

    async fn increment_token_version(&mut self, user_id: &UserId) -> Result<i64> {
        self.acquire().await?;
        let user = self
            .working
            .users
            .get_mut(user_id)
            .ok_or_else(|| LifecycleError::Database(format!("user {user_id} not found")))?;
        user.token_version += 1;
        Ok(user.token_version)
    }

    async fn insert_refresh_token(&mut self, record: &RefreshTokenRecord) -> Result<()> {
        self.acquire().await?;
        self.user_exists(&record.user_id)?;
        if self
            .working
            .refresh_tokens
            .iter()
            .any(|row| row.token_hash == record.token_hash)
        {
            return Err(LifecycleError::UniqueViolation(
                "refresh_tokens_token_hash_key".to_string(),
            ));
        }
        self.working.refresh_tokens.push(record.clone());
        Ok(())
    }

    async fn try_lock_refresh_token(
        &mut self,
        token_hash: &str,
    ) -> Result<RowLock<(RefreshTokenRecord, UserRecord)>> {
        if self.guard.is_none() && self.store.held_refresh_rows().contains(token_hash) {
            return Ok(RowLock::Busy);
        }
        self.acquire().await?;

        let Some(token) = self
            .working
            .refresh_tokens
            .iter()
            .find(|row| row.token_hash == token_hash)
            .cloned()
        else {
            return Ok(RowLock::NotFound);
        };
        let Some(user) = self.joined_user(&token.user_id) else {
            return Ok(RowLock::NotFound);
        };

        self.store.held_refresh_rows().insert(token_hash.to_string());
        self.held_refresh_row = Some(token_hash.to_string());
        Ok(RowLock::Acquired((token, user)))
    }

    async fn mark_refresh_token_used(
        &mut self,
        id: &TokenRecordId,
        used_at: DateTime<Utc>,
    ) -> Result<()> {
        self.acquire().await?;
        if let Some(row) = self.working.refresh_tokens.iter_mut().find(|row| row.id == *id) {
            row.used_at = Some(used_at);
        }
        Ok(())
    }

    async fn delete_refresh_tokens_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.acquire().await?;
        let before = self.working.refresh_tokens.len();
        self.working.refresh_tokens.retain(|row| {
            let consumed_long_ago = row.used_at.is_some_and(|used_at| used_at < cutoff);
            !(consumed_long_ago || row.expires_at < cutoff)
        });
        Ok((before - self.working.refresh_tokens.len()) as u64)
    }

    async fn insert_device_token(&mut self, record: &DeviceTokenRecord) -> Result<()> {
        self.acquire().await?;
        self.user_exists(&record.user_id)?;
        if self.device_hash_taken(&record.token_hash, None) {
            return Err(LifecycleError::UniqueViolation(
                "device_tokens_token_hash_key".to_string(),
            ));
        }
        if record.revoked_at.is_none()
            && self
                .working
                .device_tokens
                .iter()
                .any(|row| row.revoked_at.is_none() && row.same_device_as(record))
        {
            return Err(LifecycleError::UniqueViolation(
                "device_tokens_one_unrevoked_per_device".to_string(),
            ));
        }
        self.working.device_tokens.push(record.clone());
        Ok(())
    }

    async fn lock_device_token(
        &mut self,
        token_hash: &str,
    ) -> Result<Option<(DeviceTokenRecord, UserRecord)>> {
        self.acquire().await?;
        let Some(token) = self
            .working
            .device_tokens
            .iter()
            .find(|row| row.token_hash == token_hash)
            .cloned()
        else {
            return Ok(None);
        };
        Ok(self.joined_user(&token.user_id).map(|user| (token, user)))
    }

    async fn lock_aliased_device_token(
        &mut self,
        token_hash: &str,
    ) -> Result<Option<(DeviceTokenRecord, UserRecord)>> {
        self.acquire().await?;
        let Some(id) = self.working.device_token_aliases.get(token_hash).cloned() else {
            return Ok(None);
        };
        let Some(token) = self.working.device_tokens.iter().find(|row| row.id == id).cloned()
        else {
            return Ok(None);
        };
        Ok(self.joined_user(&token.user_id).map(|user| (token, user)))
    }

    async fn insert_device_token_alias(
        &mut self,
        token_hash: &str,
        id: &TokenRecordId,
        _created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.acquire().await?;
        if self.working.device_token_aliases.contains_key(token_hash) {
            return Err(LifecycleError::UniqueViolation(
                "device_token_aliases_pkey".to_string(),
            ));
        }
        self.working
            .device_token_aliases
            .insert(token_hash.to_string(), id.clone());
        Ok(())
    }

    async fn delete_device_token_aliases(&mut self, id: &TokenRecordId) -> Result<u64> {
        self.acquire().await?;
        let before = self.working.device_token_aliases.len();
        self.working
            .device_token_aliases
            .retain(|_, target| target != id);
        Ok((before - self.working.device_token_aliases.len()) as u64)
    }

    async fn find_device_token(&mut self, id: &TokenRecordId) -> Result<Option<DeviceTokenRecord>> {
        self.acquire().await?;
        Ok(self
            .working
            .device_tokens
            .iter()
            .find(|row| row.id == *id)
            .cloned())
    }

    async fn lock_active_device_token(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceTokenRecord>> {
        self.acquire().await?;
        Ok(self
            .working
            .device_tokens
            .iter()
            .find(|row| {
                row.user_id == *user_id
                    && row.device_id == *device_id
                    && row.platform == platform
                    && row.is_active_at(now)
            })
            .cloned())
    }

    async fn revoke_device_token(
        &mut self,
        id: &TokenRecordId,
        revocation: &Revocation,
    ) -> Result<()> {
        self.acquire().await?;
        if let Some(row) = self.device_row_mut(id) {
            apply_revocation(row, revocation);
        }
        Ok(())
    }

    async fn revoke_expired_device_tokens(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.acquire().await?;
        let revocation = Revocation::new(now, RevokedReason::Expired);
        let mut revoked = 0;
        for row in &mut self.working.device_tokens {
            if row.user_id == *user_id
                && row.device_id == *device_id
                && row.platform == platform
                && row.revoked_at.is_none()
                && row.expires_at <= now
            {
                apply_revocation(row, &revocation);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_user_device_tokens(
        &mut self,
        user_id: &UserId,
        revocation: &Revocation,
    ) -> Result<u64> {
        self.acquire().await?;
        let mut revoked = 0;
        for row in &mut self.working.device_tokens {
            if row.user_id == *user_id && row.revoked_at.is_none() {
                apply_revocation(row, revocation);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn sweep_expired_device_tokens(&mut self, now: DateTime<Utc>) -> Result<u64> {
        self.acquire().await?;
        let revocation = Revocation::new(now, RevokedReason::Expired);
        let mut swept = 0;
        for row in &mut self.working.device_tokens {
            if row.revoked_at.is_none() && row.expires_at <= now {
                apply_revocation(row, &revocation);
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn replace_device_token_secret(
        &mut self,
        id: &TokenRecordId,
        token_hash: &str,
        token_prefix: &str,
        usage: &DeviceUsage,
    ) -> Result<()> {
        self.acquire().await?;
        if self.device_hash_taken(token_hash, Some(id)) {
            return Err(LifecycleError::UniqueViolation(
                "device_tokens_token_hash_key".to_string(),
            ));
        }
        if let Some(row) = self.device_row_mut(id) {
            row.token_hash = token_hash.to_string();
            row.token_prefix = token_prefix.to_string();
            row.secret_issued_at = usage.last_used_at;
            apply_usage(row, usage);
        }
        Ok(())
    }

    async fn touch_device_token(&mut self, id: &TokenRecordId, usage: &DeviceUsage) -> Result<()> {
        self.acquire().await?;
        if let Some(row) = self.device_row_mut(id) {
            apply_usage(row, usage);
        }
        Ok(())
    }

    async fn list_active_device_tokens(
        &mut self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceTokenRecord>> {
        self.acquire().await?;
        let mut rows: Vec<DeviceTokenRecord> = self
            .working
            .device_tokens
            .iter()
            .filter(|row| row.user_id == *user_id && row.is_active_at(now))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(rows)
    }

    async fn commit(mut self) -> Result<()> {
        if self.guard.is_none() {
            return Ok(());
        }
        let working = std::mem::take(&mut self.working);
        let mut shared = self
            .store
            .state
            .lock()
            .map_err(|_| LifecycleError::Internal("Mutex lock failed".to_string()))?;
        *shared = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn row(user: &str, device: &str, hash: &str, now: DateTime<Utc>) -> DeviceTokenRecord {
        DeviceTokenRecord {
            id: TokenRecordId::generate(),
            user_id: UserId::new(user),
            device_id: DeviceId::new(device),
            platform: Platform::Web,
            token_hash: hash.to_string(),
            token_prefix: "dt_".to_string(),
            secret_issued_at: now,
            expires_at: now + ChronoDuration::days(1),
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
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryTokenStore::new();
        store.insert_user(&UserId::new("u1"), Role::User, 1);

        let mut tx = store.begin().await.unwrap();
        tx.increment_token_version(&UserId::new("u1")).await.unwrap();
        drop(tx);

        assert_eq!(store.user(&UserId::new("u1")).unwrap().token_version, 1);
    }

    #[tokio::test]
    async fn test_second_unrevoked_row_per_device_is_rejected() {
        let store = InMemoryTokenStore::new();
        store.insert_user(&UserId::new("u1"), Role::User, 1);
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.insert_device_token(&row("u1", "d1", "h1", now)).await.unwrap();
        let err = tx
            .insert_device_token(&row("u1", "d1", "h2", now))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_insert_for_unknown_user_fails() {
        let store = InMemoryTokenStore::new();
        let mut tx = store.begin().await.unwrap();

        let err = tx
            .insert_device_token(&row("ghost", "d1", "h1", Utc::now()))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Database(_)));
    }

    #[tokio::test]
    async fn test_first_access_times_out_while_transaction_open() {
        let store = InMemoryTokenStore::new().with_lock_timeout(Duration::from_millis(20));
        store.insert_user(&UserId::new("u1"), Role::User, 1);
        let mut held = store.begin().await.unwrap();
        held.lock_user(&UserId::new("u1")).await.unwrap();

        let mut waiting = store.begin().await.unwrap();
        let err = waiting.lock_user(&UserId::new("u1")).await.unwrap_err();

        assert_eq!(err, LifecycleError::LockTimeout);
    }

    #[tokio::test]
    async fn test_held_refresh_row_is_busy_until_released() {
        let store = InMemoryTokenStore::new();
        store.insert_user(&UserId::new("u1"), Role::User, 1);
        let now = Utc::now();
        let mut setup = store.begin().await.unwrap();
        setup
            .insert_refresh_token(&RefreshTokenRecord {
                id: TokenRecordId::generate(),
                user_id: UserId::new("u1"),
                token_hash: "rh".to_string(),
                expires_at: now + ChronoDuration::days(1),
                used_at: None,
                created_at: now,
            })
            .await
            .unwrap();
        setup.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        assert!(first.try_lock_refresh_token("rh").await.unwrap().acquired().is_some());

        let mut second = store.begin().await.unwrap();
        assert_eq!(second.try_lock_refresh_token("rh").await.unwrap(), RowLock::Busy);
        drop(second);
        drop(first);

        let mut third = store.begin().await.unwrap();
        assert!(third.try_lock_refresh_token("rh").await.unwrap().acquired().is_some());
        assert_eq!(third.try_lock_refresh_token("missing").await.unwrap(), RowLock::NotFound);
    }

    #[tokio::test]
    async fn test_alias_resolves_to_its_row() {
        let store = InMemoryTokenStore::new();
        store.insert_user(&UserId::new("u1"), Role::User, 1);
        let record = row("u1", "d1", "current", Utc::now());

        let mut tx = store.begin().await.unwrap();
        tx.insert_device_token(&record).await.unwrap();
        tx.insert_device_token_alias("superseded", &record.id, Utc::now())
            .await
            .unwrap();
        let (found, _) = tx.lock_presented_device_token("superseded").await.unwrap().unwrap();
        assert_eq!(found.id, record.id);

        assert_eq!(tx.delete_device_token_aliases(&record.id).await.unwrap(), 1);
        assert!(tx.lock_presented_device_token("superseded").await.unwrap().is_none());
    }
}
