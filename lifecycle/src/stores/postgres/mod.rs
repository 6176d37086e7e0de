//! `PostgreSQL` storage implementation.

mod rows;
mod store;

pub use store::{PostgresTokenStore, PostgresTransaction};
