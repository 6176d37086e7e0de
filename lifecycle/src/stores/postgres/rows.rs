//! Row shapes returned by the token queries.
//!
//! Enumerations are stored as text; a value the schema's CHECK constraints
//! should have prevented surfaces as [`LifecycleError::Internal`].

use crate::error::{LifecycleError, Result};
use crate::state::{
    DeviceId, DeviceTokenRecord, RefreshTokenRecord, RevokedReason, TokenRecordId, UnknownVariant,
    UserId, UserRecord,
};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Columns of `device_tokens`, qualified with the `dt` alias every device
/// token query uses.
macro_rules! device_token_columns {
    () => {
        "dt.id, dt.user_id, dt.device_id, dt.platform, dt.token_hash, dt.token_prefix, \
         dt.secret_issued_at, dt.expires_at, dt.revoked_at, dt.revoked_reason, dt.replaced_by_token_id, \
         dt.device_name, dt.user_agent, dt.last_ip_address, dt.trust_score, \
         dt.suspicious_activity_count, dt.last_used_at, dt.created_at"
    };
}

/// Columns of `refresh_tokens`, qualified with the `rt` alias.
macro_rules! refresh_token_columns {
    () => {
        "rt.id, rt.user_id, rt.token_hash, rt.expires_at, rt.used_at, rt.created_at"
    };
}

pub(crate) use {device_token_columns, refresh_token_columns};

fn corrupt(err: &UnknownVariant) -> LifecycleError {
    LifecycleError::Internal(format!("Corrupt row: {err}"))
}

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    id: String,
    role: String,
    token_version: i64,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = LifecycleError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: UserId(row.id),
            role: row.role.parse().map_err(|e| corrupt(&e))?,
            token_version: row.token_version,
        })
    }
}

/// Owner columns appended to joined token queries as
/// `u.role AS owner_role, u.token_version AS owner_token_version`.
#[derive(Debug, FromRow)]
pub(crate) struct OwnerColumns {
    owner_role: String,
    owner_token_version: i64,
}

impl OwnerColumns {
    fn into_user(self, id: &UserId) -> Result<UserRecord> {
        UserRow {
            id: id.0.clone(),
            role: self.owner_role,
            token_version: self.owner_token_version,
        }
        .try_into()
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RefreshTokenRow {
    id: String,
    user_id: String,
    token_hash: String,
    expires_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<RefreshTokenRow> for RefreshTokenRecord {
    fn from(row: RefreshTokenRow) -> Self {
        Self {
            id: TokenRecordId(row.id),
            user_id: UserId(row.user_id),
            token_hash: row.token_hash,
            expires_at: row.expires_at,
            used_at: row.used_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RefreshTokenWithOwnerRow {
    #[sqlx(flatten)]
    token: RefreshTokenRow,
    #[sqlx(flatten)]
    owner: OwnerColumns,
}

impl TryFrom<RefreshTokenWithOwnerRow> for (RefreshTokenRecord, UserRecord) {
    type Error = LifecycleError;

    fn try_from(row: RefreshTokenWithOwnerRow) -> Result<Self> {
        let token = RefreshTokenRecord::from(row.token);
        let user = row.owner.into_user(&token.user_id)?;
        Ok((token, user))
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DeviceTokenRow {
    id: String,
    user_id: String,
    device_id: String,
    platform: String,
    token_hash: String,
    token_prefix: String,
    secret_issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    revoked_reason: Option<String>,
    replaced_by_token_id: Option<String>,
    device_name: Option<String>,
    user_agent: Option<String>,
    last_ip_address: Option<String>,
    trust_score: f64,
    suspicious_activity_count: i32,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeviceTokenRow> for DeviceTokenRecord {
    type Error = LifecycleError;

    fn try_from(row: DeviceTokenRow) -> Result<Self> {
        Ok(Self {
            id: TokenRecordId(row.id),
            user_id: UserId(row.user_id),
            device_id: DeviceId(row.device_id),
            platform: row.platform.parse().map_err(|e| corrupt(&e))?,
            token_hash: row.token_hash,
            token_prefix: row.token_prefix,
            secret_issued_at: row.secret_issued_at,
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
            revoked_reason: row
                .revoked_reason
                .map(|reason| reason.parse::<RevokedReason>())
                .transpose()
                .map_err(|e| corrupt(&e))?,
            replaced_by_token_id: row.replaced_by_token_id.map(TokenRecordId),
            device_name: row.device_name,
            user_agent: row.user_agent,
            last_ip_address: row.last_ip_address,
            trust_score: row.trust_score,
            suspicious_activity_count: row.suspicious_activity_count,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DeviceTokenWithOwnerRow {
    #[sqlx(flatten)]
    token: DeviceTokenRow,
    #[sqlx(flatten)]
    owner: OwnerColumns,
}

impl TryFrom<DeviceTokenWithOwnerRow> for (DeviceTokenRecord, UserRecord) {
    type Error = LifecycleError;

    fn try_from(row: DeviceTokenWithOwnerRow) -> Result<Self> {
        let token = DeviceTokenRecord::try_from(row.token)?;
        let user = row.owner.into_user(&token.user_id)?;
        Ok((token, user))
    }
}
