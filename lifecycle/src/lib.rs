//! # Token Lifecycle
//!
//! Atomic lifecycle management for the two long-lived credentials of an
//! authentication system: single-use refresh tokens and rotating per-device
//! tokens.
//!
//! ## Features
//!
//! - **Single-use refresh**: a consumed refresh token is marked, not deleted,
//!   so a replay is recognised and answered by invalidating every session
//! - **Rotation with grace period**: duplicate rotation requests from flaky
//!   clients are absorbed for a configurable window
//! - **Serialized provisioning**: concurrent logins from one device converge
//!   on a single active device token
//! - **Session epochs**: bumping a user's `token_version` invalidates every
//!   token minted before
//!
//! ## Architecture
//!
//! Correctness rests on the store's row-level locks, never on in-process
//! mutexes, so any number of service instances can share one database:
//!
//! ```text
//! TokenLifecycleManager ──▶ TokenStore::begin ──▶ TokenTransaction
//!         │                                        (SELECT ... FOR UPDATE)
//!         └──▶ TokenCodec (hash, encode, verify)
//! ```
//!
//! ## Example: Refresh
//!
//! ```rust,ignore
//! use token_lifecycle::*;
//!
//! let manager = TokenLifecycleManager::new(LifecycleEnvironment::new(store, codec));
//!
//! match manager.consume_refresh_token(&raw, Some(claims.token_version)).await? {
//!     RefreshOutcome::Refreshed { user_id, token_version, role } => {
//!         issue_access_token(user_id, token_version, role)
//!     }
//!     RefreshOutcome::Rejected(failure) => unauthorized(failure.user_message()),
//! }
//! ```

// Public modules
pub mod config;
pub mod constants;
pub mod environment;
pub mod error;
pub mod manager;
pub mod outcome;
pub mod providers;
pub mod provisioning;
pub mod state;
pub mod stores;

mod maintenance;
mod refresh;
mod rotation;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

// Re-export main types for convenience
pub use config::LifecycleConfig;
pub use environment::{Clock, LifecycleEnvironment, SystemClock};
pub use error::{LifecycleError, Result};
pub use manager::TokenLifecycleManager;
pub use outcome::{
    IssuedRefreshToken, ProvisionOutcome, ProvisionedDeviceToken, RefreshOutcome,
    RotationOutcome, SessionInvalidation, TokenFailure,
};
pub use providers::{
    DeviceTokenClaims, Revocation, RowLock, TokenCodec, TokenStore, TokenTransaction,
};
pub use provisioning::ProvisionRequest;
pub use state::{
    DeviceId, DeviceTokenRecord, DeviceTokenSummary, Platform, RefreshTokenRecord,
    RequestMetadata, RevokedReason, Role, TokenRecordId, UserId, UserRecord,
};
