//! Error types for token lifecycle operations.
//!
//! Only transport-level failures live here. Expected authentication outcomes
//! (expired, revoked, reused tokens and so on) are reported as typed rejections
//! on the operation outcomes in [`crate::outcome`], so callers never have to
//! string-match an error to pick an HTTP status.

use thiserror::Error;

/// Result type alias for token lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Store and infrastructure failures.
///
/// None of these imply anything about the presented credential. The
/// transaction that hit the failure never committed, so the whole operation
/// may be retried with the same raw token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    // ═══════════════════════════════════════════════════════════
    // Store Errors
    // ═══════════════════════════════════════════════════════════

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Waiting for a row lock exceeded the configured lock timeout.
    #[error("Timed out waiting for a row lock")]
    LockTimeout,

    /// A statement exceeded the configured statement timeout.
    #[error("Statement timed out")]
    StatementTimeout,

    /// A uniqueness constraint rejected a write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════

    /// Internal error (should not be exposed to users).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    /// Returns `true` if retrying the whole operation may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use token_lifecycle::LifecycleError;
    /// assert!(LifecycleError::LockTimeout.is_retryable());
    /// assert!(!LifecycleError::Internal("bug".into()).is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout | Self::StatementTimeout | Self::Database(_)
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for LifecycleError {
    fn from(err: sqlx::Error) -> Self {
        /// `lock_not_available`, raised when `lock_timeout` fires.
        const LOCK_NOT_AVAILABLE: &str = "55P03";
        /// `query_canceled`, raised when `statement_timeout` fires.
        const QUERY_CANCELED: &str = "57014";

        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::UniqueViolation(db_err.message().to_string());
            }
            match db_err.code().as_deref() {
                Some(LOCK_NOT_AVAILABLE) => return Self::LockTimeout,
                Some(QUERY_CANCELED) => return Self::StatementTimeout,
                _ => {}
            }
        }

        Self::Database(err.to_string())
    }
}
