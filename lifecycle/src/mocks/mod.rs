//! Mock provider implementations for testing.
//!
//! This module provides simple, in-memory implementations of the store,
//! codec and clock for use in unit and integration tests, plus a fixture
//! wiring them into a manager.

pub mod clock;
pub mod codec;
pub mod store;

pub use clock::ManualClock;
pub use codec::MockTokenCodec;
pub use store::{InMemoryTokenStore, InMemoryTransaction};

use crate::config::LifecycleConfig;
use crate::constants::defaults;
use crate::environment::LifecycleEnvironment;
use crate::manager::TokenLifecycleManager;
use crate::providers::TokenCodec;
use crate::state::{DeviceId, DeviceTokenRecord, Platform, TokenRecordId, UserId};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Fixed start time for fixtures (2024-01-01T00:00:00Z).
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default() + Duration::days(19_723)
}

/// A manager over in-memory collaborators, with handles to each of them.
#[derive(Clone)]
pub struct TestFixture {
    /// Manager under test.
    pub manager: TokenLifecycleManager<InMemoryTokenStore>,
    /// Handle to the manager's store.
    pub store: InMemoryTokenStore,
    /// Handle to the manager's codec.
    pub codec: Arc<MockTokenCodec>,
    /// Handle to the manager's clock, stopped at [`epoch`].
    pub clock: Arc<ManualClock>,
}

impl TestFixture {
    /// Insert an active device token row issued now and return its raw token.
    ///
    /// The owner must already exist in the store.
    pub fn seed_device_token(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        platform: Platform,
        token_version: i64,
    ) -> String {
        let raw = self.codec.mint(user_id, device_id, platform, token_version);
        let now = self.clock.current();
        self.store.put_device_token(DeviceTokenRecord {
            id: TokenRecordId::generate(),
            user_id: user_id.clone(),
            device_id: device_id.clone(),
            platform,
            token_hash: self.codec.hash_token(&raw),
            token_prefix: self.codec.token_prefix(&raw),
            secret_issued_at: now,
            expires_at: now + self.manager.environment().config.device_token_ttl,
            revoked_at: None,
            revoked_reason: None,
            replaced_by_token_id: None,
            device_name: None,
            user_agent: None,
            last_ip_address: None,
            trust_score: defaults::INITIAL_TRUST_SCORE,
            suspicious_activity_count: 0,
            last_used_at: None,
            created_at: now,
        });
        raw
    }
}

/// Fixture with default policy.
#[must_use]
pub fn fixture(store: InMemoryTokenStore) -> TestFixture {
    fixture_with_config(store, LifecycleConfig::default())
}

/// Fixture with the given policy.
#[must_use]
pub fn fixture_with_config(store: InMemoryTokenStore, config: LifecycleConfig) -> TestFixture {
    let codec = Arc::new(MockTokenCodec::new());
    let clock = Arc::new(ManualClock::new(epoch()));
    let env = LifecycleEnvironment::new(store.clone(), codec.clone())
        .with_clock(clock.clone())
        .with_config(config);

    TestFixture {
        manager: TokenLifecycleManager::new(env),
        store,
        codec,
        clock,
    }
}
