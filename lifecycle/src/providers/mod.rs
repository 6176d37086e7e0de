//! Token lifecycle providers.
//!
//! This module defines traits for the external dependencies of the
//! lifecycle manager. These traits enable dependency injection and make the
//! race-critical logic testable at memory speed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │ TokenLifecycleManager    │        │ TokenCodec               │
//! │ - consume_refresh_token  │──────▶ │ - hash_token             │
//! │ - rotate_device_token    │        │ - generate_device_token  │
//! │ - validate_or_create_... │        │ - validate_..._payload   │
//! └────────────┬─────────────┘        └──────────────────────────┘
//!              │ begin()
//!              ▼
//! ┌──────────────────────────┐
//! │ TokenStore               │  PostgreSQL: SELECT ... FOR UPDATE
//! │  └─ TokenTransaction     │  In-memory: serialized transactions
//! └──────────────────────────┘
//! ```
//!
//! - **Testing**: `InMemoryTokenStore` and `MockTokenCodec` from [`crate::mocks`]
//! - **Production**: `PostgresTokenStore` and an application-supplied codec

pub mod codec;
pub mod store;

// Re-export provider traits
pub use codec::{DeviceTokenClaims, TokenCodec};
pub use store::{Revocation, RowLock, TokenStore, TokenTransaction};
