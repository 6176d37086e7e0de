//! `PostgreSQL` token store.
//!
//! Every transaction starts with `SET LOCAL lock_timeout` and
//! `SET LOCAL statement_timeout`, so a stalled peer holding a row lock can
//! only delay a request by a bounded amount. Lock queries use
//! `FOR UPDATE OF <alias>` so the joined `users` row is read but not locked.
//! Refresh token consumption uses `SKIP LOCKED` instead of waiting: a
//! duplicate request never observes the winner's commit.
//!
//! # Example
//!
//! ```no_run
//! use token_lifecycle::LifecycleConfig;
//! use token_lifecycle::stores::PostgresTokenStore;
//! use sqlx::PgPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPool::connect("postgresql://localhost/auth").await?;
//! let store = PostgresTokenStore::new(pool, &LifecycleConfig::default());
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

use super::rows::{
    DeviceTokenRow, DeviceTokenWithOwnerRow, RefreshTokenWithOwnerRow, UserRow,
    device_token_columns, refresh_token_columns,
};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, Result};
use crate::providers::{Revocation, RowLock, TokenStore, TokenTransaction};
use crate::state::{
    DeviceId, DeviceTokenRecord, DeviceUsage, Platform, RefreshTokenRecord, RevokedReason,
    TokenRecordId, UserId, UserRecord,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use std::time::Duration;

/// `PostgreSQL` token store.
#[derive(Clone)]
pub struct PostgresTokenStore {
    /// `PostgreSQL` connection pool.
    pool: PgPool,
    lock_timeout: Duration,
    statement_timeout: Duration,
}

impl PostgresTokenStore {
    /// Create a new `PostgreSQL` token store.
    ///
    /// Lock and statement timeouts are taken from `config`.
    #[must_use]
    pub const fn new(pool: PgPool, config: &LifecycleConfig) -> Self {
        Self {
            pool,
            lock_timeout: config.lock_timeout,
            statement_timeout: config.statement_timeout,
        }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LifecycleError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }
}

impl TokenStore for PostgresTokenStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        let mut tx = self.pool.begin().await?;

        // SET does not take bind parameters; both values are integers we own.
        let lock_timeout = format!("SET LOCAL lock_timeout = {}", self.lock_timeout.as_millis());
        sqlx::query(&lock_timeout).execute(&mut *tx).await?;

        let statement_timeout = format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        );
        sqlx::query(&statement_timeout).execute(&mut *tx).await?;

        Ok(PostgresTransaction { tx })
    }
}

/// Transaction over a [`PostgresTokenStore`].
///
/// Dropping it without committing rolls back.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl TokenTransaction for PostgresTransaction {
    async fn lock_user(&mut self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            r"
            SELECT id, role, token_version
            FROM users
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(user_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(UserRecord::try_from).transpose()
    }

    async fn increment_token_version(&mut self, user_id: &UserId) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE users
            SET token_version = token_version + 1
            WHERE id = $1
            RETURNING token_version
            ",
        )
        .bind(user_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        version.ok_or_else(|| LifecycleError::Database(format!("user {user_id} not found")))
    }

    async fn insert_refresh_token(&mut self, record: &RefreshTokenRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(record.id.as_str())
        .bind(record.user_id.as_str())
        .bind(&record.token_hash)
        .bind(record.expires_at)
        .bind(record.used_at)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn try_lock_refresh_token(
        &mut self,
        token_hash: &str,
    ) -> Result<RowLock<(RefreshTokenRecord, UserRecord)>> {
        let row = sqlx::query_as::<_, RefreshTokenWithOwnerRow>(concat!(
            "SELECT ",
            refresh_token_columns!(),
            ", u.role AS owner_role, u.token_version AS owner_token_version \
             FROM refresh_tokens rt \
             JOIN users u ON u.id = rt.user_id \
             WHERE rt.token_hash = $1 \
             FOR UPDATE OF rt SKIP LOCKED"
        ))
        .bind(token_hash)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(row) = row {
            return Ok(RowLock::Acquired(row.try_into()?));
        }

        // Skipped rows are still visible to a plain read.
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM refresh_tokens WHERE token_hash = $1)",
        )
        .bind(token_hash)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(if exists { RowLock::Busy } else { RowLock::NotFound })
    }

    async fn mark_refresh_token_used(
        &mut self,
        id: &TokenRecordId,
        used_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE refresh_tokens SET used_at = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(used_at)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn delete_refresh_tokens_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM refresh_tokens
            WHERE used_at < $1 OR expires_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_device_token(&mut self, record: &DeviceTokenRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO device_tokens (
                id, user_id, device_id, platform, token_hash, token_prefix,
                secret_issued_at, expires_at, revoked_at, revoked_reason,
                replaced_by_token_id, device_name, user_agent, last_ip_address,
                trust_score, suspicious_activity_count, last_used_at, created_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
            )
            ",
        )
        .bind(record.id.as_str())
        .bind(record.user_id.as_str())
        .bind(record.device_id.as_str())
        .bind(record.platform.as_str())
        .bind(&record.token_hash)
        .bind(&record.token_prefix)
        .bind(record.secret_issued_at)
        .bind(record.expires_at)
        .bind(record.revoked_at)
        .bind(record.revoked_reason.map(RevokedReason::as_str))
        .bind(record.replaced_by_token_id.as_ref().map(TokenRecordId::as_str))
        .bind(record.device_name.as_deref())
        .bind(record.user_agent.as_deref())
        .bind(record.last_ip_address.as_deref())
        .bind(record.trust_score)
        .bind(record.suspicious_activity_count)
        .bind(record.last_used_at)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn lock_device_token(
        &mut self,
        token_hash: &str,
    ) -> Result<Option<(DeviceTokenRecord, UserRecord)>> {
        let row = sqlx::query_as::<_, DeviceTokenWithOwnerRow>(concat!(
            "SELECT ",
            device_token_columns!(),
            ", u.role AS owner_role, u.token_version AS owner_token_version \
             FROM device_tokens dt \
             JOIN users u ON u.id = dt.user_id \
             WHERE dt.token_hash = $1 \
             FOR UPDATE OF dt"
        ))
        .bind(token_hash)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn lock_aliased_device_token(
        &mut self,
        token_hash: &str,
    ) -> Result<Option<(DeviceTokenRecord, UserRecord)>> {
        let row = sqlx::query_as::<_, DeviceTokenWithOwnerRow>(concat!(
            "SELECT ",
            device_token_columns!(),
            ", u.role AS owner_role, u.token_version AS owner_token_version \
             FROM device_token_aliases a \
             JOIN device_tokens dt ON dt.id = a.device_token_id \
             JOIN users u ON u.id = dt.user_id \
             WHERE a.token_hash = $1 \
             FOR UPDATE OF dt"
        ))
        .bind(token_hash)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn insert_device_token_alias(
        &mut self,
        token_hash: &str,
        id: &TokenRecordId,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO device_token_aliases (token_hash, device_token_id, created_at)
            VALUES ($1, $2, $3)
            ",
        )
        .bind(token_hash)
        .bind(id.as_str())
        .bind(created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn delete_device_token_aliases(&mut self, id: &TokenRecordId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM device_token_aliases WHERE device_token_id = $1")
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn find_device_token(&mut self, id: &TokenRecordId) -> Result<Option<DeviceTokenRecord>> {
        let row = sqlx::query_as::<_, DeviceTokenRow>(concat!(
            "SELECT ",
            device_token_columns!(),
            " FROM device_tokens dt WHERE dt.id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(DeviceTokenRecord::try_from).transpose()
    }

    async fn lock_active_device_token(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceTokenRecord>> {
        let row = sqlx::query_as::<_, DeviceTokenRow>(concat!(
            "SELECT ",
            device_token_columns!(),
            " FROM device_tokens dt \
             WHERE dt.user_id = $1 AND dt.device_id = $2 AND dt.platform = $3 \
               AND dt.revoked_at IS NULL AND dt.expires_at > $4 \
             FOR UPDATE"
        ))
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .bind(platform.as_str())
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(DeviceTokenRecord::try_from).transpose()
    }

    async fn revoke_device_token(
        &mut self,
        id: &TokenRecordId,
        revocation: &Revocation,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE device_tokens
            SET revoked_at = $2, revoked_reason = $3, replaced_by_token_id = $4
            WHERE id = $1
            ",
        )
        .bind(id.as_str())
        .bind(revocation.at)
        .bind(revocation.reason.as_str())
        .bind(revocation.replaced_by.as_ref().map(TokenRecordId::as_str))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn revoke_expired_device_tokens(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_tokens
            SET revoked_at = $4, revoked_reason = 'expired'
            WHERE user_id = $1 AND device_id = $2 AND platform = $3
              AND revoked_at IS NULL AND expires_at <= $4
            ",
        )
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .bind(platform.as_str())
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_user_device_tokens(
        &mut self,
        user_id: &UserId,
        revocation: &Revocation,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_tokens
            SET revoked_at = $2, revoked_reason = $3
            WHERE user_id = $1 AND revoked_at IS NULL
            ",
        )
        .bind(user_id.as_str())
        .bind(revocation.at)
        .bind(revocation.reason.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn sweep_expired_device_tokens(&mut self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_tokens
            SET revoked_at = $1, revoked_reason = 'expired'
            WHERE revoked_at IS NULL AND expires_at <= $1
            ",
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn replace_device_token_secret(
        &mut self,
        id: &TokenRecordId,
        token_hash: &str,
        token_prefix: &str,
        usage: &DeviceUsage,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE device_tokens
            SET token_hash = $2,
                token_prefix = $3,
                secret_issued_at = $4,
                last_used_at = $4,
                last_ip_address = COALESCE($5, last_ip_address),
                user_agent = COALESCE($6, user_agent)
            WHERE id = $1
            ",
        )
        .bind(id.as_str())
        .bind(token_hash)
        .bind(token_prefix)
        .bind(usage.last_used_at)
        .bind(usage.last_ip_address.as_deref())
        .bind(usage.user_agent.as_deref())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn touch_device_token(&mut self, id: &TokenRecordId, usage: &DeviceUsage) -> Result<()> {
        sqlx::query(
            r"
            UPDATE device_tokens
            SET last_used_at = $2,
                last_ip_address = COALESCE($3, last_ip_address),
                user_agent = COALESCE($4, user_agent)
            WHERE id = $1
            ",
        )
        .bind(id.as_str())
        .bind(usage.last_used_at)
        .bind(usage.last_ip_address.as_deref())
        .bind(usage.user_agent.as_deref())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn list_active_device_tokens(
        &mut self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceTokenRecord>> {
        let rows = sqlx::query_as::<_, DeviceTokenRow>(concat!(
            "SELECT ",
            device_token_columns!(),
            " FROM device_tokens dt \
             WHERE dt.user_id = $1 AND dt.revoked_at IS NULL AND dt.expires_at > $2 \
             ORDER BY dt.last_used_at DESC NULLS LAST, dt.created_at DESC"
        ))
        .bind(user_id.as_str())
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(DeviceTokenRecord::try_from).collect()
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
