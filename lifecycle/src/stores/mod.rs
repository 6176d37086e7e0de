//! Storage implementations for the token lifecycle.
//!
//! - **Token Store** (`PostgreSQL`) - Transactional storage with row-level
//!   locks, behind the `postgres` feature
//!
//! An in-memory store for tests lives in `crate::mocks` (feature
//! `test-utils`).

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-exports
#[cfg(feature = "postgres")]
pub use postgres::{PostgresTokenStore, PostgresTransaction};
