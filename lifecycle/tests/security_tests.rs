//! Security-focused integration tests.
//!
//! This module verifies the critical properties of the token lifecycle
//! against the in-memory store:
//!
//! - Single-use refresh tokens under concurrency
//! - Global lockout after a refresh token replay
//! - Session epoch invalidation
//! - Rotation grace period idempotence
//! - Convergence of concurrent device provisioning

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Duration;
use futures::future::join_all;
use token_lifecycle::mocks::{InMemoryTokenStore, TestFixture, fixture, fixture_with_config};
use token_lifecycle::{
    DeviceId, LifecycleConfig, LifecycleError, Platform, ProvisionRequest, RefreshOutcome,
    RequestMetadata, RevokedReason, Role, RotationOutcome, TokenCodec, TokenFailure, TokenStore,
    TokenTransaction, UserId,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("token_lifecycle=debug")
        .with_test_writer()
        .try_init();
}

fn with_user(version: i64) -> (TestFixture, UserId) {
    init_tracing();
    let fx = fixture(InMemoryTokenStore::new());
    let user = UserId::new("u1");
    fx.store.insert_user(&user, Role::User, version);
    (fx, user)
}

// ═══════════════════════════════════════════════════════════════════════
// Refresh tokens
// ═══════════════════════════════════════════════════════════════════════

/// Login, refresh, replay.
#[tokio::test]
async fn test_refresh_then_replay_is_detected() {
    let (fx, user) = with_user(1);
    let r1 = fx.manager.issue_refresh_token(&user).await.unwrap();

    let first = fx.manager.consume_refresh_token(&r1.raw_token, None).await.unwrap();
    assert_eq!(
        first,
        RefreshOutcome::Refreshed {
            user_id: user.clone(),
            token_version: 1,
            role: Role::User,
        }
    );

    let replay = fx.manager.consume_refresh_token(&r1.raw_token, None).await.unwrap();
    assert!(replay.is_token_reuse(), "❌ Replay must be reported as reuse");
    assert!(!replay.is_success());
}

/// N simultaneous consumptions of one token: exactly one wins.
#[tokio::test]
async fn test_concurrent_refresh_single_use() {
    let (fx, user) = with_user(1);
    let issued = fx.manager.issue_refresh_token(&user).await.unwrap();

    let attempts = (0..8).map(|_| {
        let manager = fx.manager.clone();
        let raw = issued.raw_token.clone();
        tokio::spawn(async move { manager.consume_refresh_token(&raw, None).await })
    });
    let outcomes: Vec<RefreshOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let successes = outcomes.iter().filter(|o| o.is_success()).count();
    assert_eq!(successes, 1, "❌ Exactly one consumption may succeed");
    assert!(outcomes.iter().all(|o| o.is_success() || o.failure().is_some()));
}

/// A duplicate that arrives while the first consumption is still open is
/// turned away without tripping reuse detection.
#[tokio::test]
async fn test_in_flight_duplicate_keeps_sessions() {
    let (fx, user) = with_user(1);
    let phone = fx.seed_device_token(&user, &DeviceId::new("phone"), Platform::Ios, 1);
    let issued = fx.manager.issue_refresh_token(&user).await.unwrap();
    let hash = fx.codec.hash_token(&issued.raw_token);

    let mut in_flight = fx.store.begin().await.unwrap();
    let (token, _) = in_flight
        .try_lock_refresh_token(&hash)
        .await
        .unwrap()
        .acquired()
        .unwrap();

    let duplicate = fx.manager.consume_refresh_token(&issued.raw_token, None).await.unwrap();
    assert_eq!(duplicate, RefreshOutcome::Rejected(TokenFailure::InvalidToken));
    assert!(!duplicate.is_token_reuse());

    in_flight
        .mark_refresh_token_used(&token.id, fx.clock.current())
        .await
        .unwrap();
    in_flight.commit().await.unwrap();

    assert_eq!(fx.store.user(&user).unwrap().token_version, 1);
    let rotation = fx
        .manager
        .rotate_device_token(&phone, &RequestMetadata::default())
        .await
        .unwrap();
    assert!(rotation.new_token().is_some(), "❌ Devices must survive a duplicate");
}

/// A replay bumps the epoch and revokes every device of the user; later
/// rotation of any of them fails with `revoked`.
#[tokio::test]
async fn test_reuse_locks_out_every_device() {
    let (fx, user) = with_user(1);
    let phone = fx.seed_device_token(&user, &DeviceId::new("phone"), Platform::Ios, 1);
    let laptop = fx.seed_device_token(&user, &DeviceId::new("laptop"), Platform::Desktop, 1);
    let issued = fx.manager.issue_refresh_token(&user).await.unwrap();

    fx.manager.consume_refresh_token(&issued.raw_token, None).await.unwrap();
    let replay = fx.manager.consume_refresh_token(&issued.raw_token, None).await.unwrap();
    assert_eq!(replay, RefreshOutcome::Rejected(TokenFailure::TokenReuse));

    assert_eq!(fx.store.user(&user).unwrap().token_version, 2);
    for row in fx.store.device_tokens() {
        assert_eq!(row.revoked_reason, Some(RevokedReason::TokenReuseDetected));
    }

    for raw in [phone, laptop] {
        let outcome = fx
            .manager
            .rotate_device_token(&raw, &RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(outcome, RotationOutcome::Rejected(TokenFailure::Revoked));
    }
}

/// Reuse wins over expiry: a stolen, consumed token replayed after it
/// expired still triggers the lockout.
#[tokio::test]
async fn test_expired_replay_still_locks_out() {
    let (fx, user) = with_user(1);
    let issued = fx.manager.issue_refresh_token(&user).await.unwrap();
    fx.manager.consume_refresh_token(&issued.raw_token, None).await.unwrap();

    fx.clock.advance(Duration::days(31));
    let replay = fx.manager.consume_refresh_token(&issued.raw_token, None).await.unwrap();

    assert!(replay.is_token_reuse());
    assert_eq!(fx.store.user(&user).unwrap().token_version, 2);
}

/// After a replay, the other refresh tokens of the user only refresh for
/// callers presenting the new epoch.
#[tokio::test]
async fn test_reuse_invalidates_sibling_sessions_by_epoch() {
    let (fx, user) = with_user(1);
    let stolen = fx.manager.issue_refresh_token(&user).await.unwrap();
    let sibling = fx.manager.issue_refresh_token(&user).await.unwrap();

    fx.manager.consume_refresh_token(&stolen.raw_token, Some(1)).await.unwrap();
    fx.manager.consume_refresh_token(&stolen.raw_token, Some(1)).await.unwrap();

    let outcome = fx
        .manager
        .consume_refresh_token(&sibling.raw_token, Some(1))
        .await
        .unwrap();
    assert_eq!(outcome, RefreshOutcome::Rejected(TokenFailure::InvalidVersion));
}

// ═══════════════════════════════════════════════════════════════════════
// Device tokens
// ═══════════════════════════════════════════════════════════════════════

/// Rotate, then immediately rotate the same token again.
#[tokio::test]
async fn test_rotation_retry_within_grace_period() {
    let (fx, user) = with_user(1);
    let d1 = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Android, 1);

    let first = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    let d2 = first.new_token().map(str::to_owned).expect("first rotation issues a token");
    assert_ne!(d1, d2);

    let retry = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    assert!(retry.is_success());
    assert!(retry.is_grace_period_retry());
    assert_eq!(retry.new_token(), None);
    assert_eq!(retry.device_token_id(), first.device_token_id());

    fx.clock.advance(Duration::seconds(31));
    let late = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    assert_eq!(late, RotationOutcome::Rejected(TokenFailure::AlreadyRotated));

    // The successor keeps rotating normally.
    let next = fx
        .manager
        .rotate_device_token(&d2, &RequestMetadata::default())
        .await
        .unwrap();
    assert!(next.new_token().is_some());
}

/// The grace period is policy, not a constant.
#[tokio::test]
async fn test_grace_period_is_configurable() {
    init_tracing();
    let fx = fixture_with_config(
        InMemoryTokenStore::new(),
        LifecycleConfig::default().with_grace_period(Duration::seconds(5)),
    );
    let user = UserId::new("u1");
    fx.store.insert_user(&user, Role::User, 1);
    let d1 = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Web, 1);

    fx.manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    fx.clock.advance(Duration::seconds(6));

    let retry = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    assert_eq!(retry, RotationOutcome::Rejected(TokenFailure::AlreadyRotated));
}

/// A retry inside the window is refused once the successor itself is gone.
#[tokio::test]
async fn test_grace_period_requires_live_successor() {
    let (fx, user) = with_user(1);
    let d1 = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Web, 1);

    let first = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    let d2 = first.new_token().unwrap().to_owned();
    fx.manager
        .revoke_device_token(&d2, RevokedReason::Logout)
        .await
        .unwrap();

    let retry = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    assert_eq!(retry, RotationOutcome::Rejected(TokenFailure::AlreadyRotated));
}

/// Concurrent rotations of one token mint exactly one successor.
#[tokio::test]
async fn test_concurrent_rotation_mints_one_successor() {
    let (fx, user) = with_user(1);
    let d1 = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Ios, 1);

    let attempts = (0..6).map(|_| {
        let manager = fx.manager.clone();
        let raw = d1.clone();
        tokio::spawn(async move {
            manager
                .rotate_device_token(&raw, &RequestMetadata::default())
                .await
        })
    });
    let outcomes: Vec<RotationOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let minted = outcomes.iter().filter(|o| o.new_token().is_some()).count();
    let retries = outcomes.iter().filter(|o| o.is_grace_period_retry()).count();
    assert_eq!(minted, 1);
    assert_eq!(retries, 5);
    assert_eq!(fx.store.device_tokens().len(), 2);
}

/// Tokens minted before an epoch bump neither rotate nor validate.
#[tokio::test]
async fn test_version_epoch_invalidation() {
    let (fx, user) = with_user(1);
    let device = DeviceId::new("d1");
    let stale = fx.seed_device_token(&user, &device, Platform::Web, 1);

    let invalidation = fx
        .manager
        .invalidate_user_sessions(&user, RevokedReason::Logout)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invalidation.new_token_version, 2);

    let rotated = fx
        .manager
        .rotate_device_token(&stale, &RequestMetadata::default())
        .await
        .unwrap();
    assert!(!rotated.is_success());

    // Same device, fresh session at v2, still holding the v1 token.
    let request = ProvisionRequest::new(user.clone(), device, Platform::Web, 2)
        .with_provided_token(stale);
    let outcome = fx
        .manager
        .validate_or_create_device_token(&request, &RequestMetadata::default())
        .await
        .unwrap();
    assert_eq!(outcome.failure(), Some(TokenFailure::InvalidVersion));
}

/// An unrevoked device token minted before an external epoch bump is
/// rejected as a version mismatch, not rotated.
#[tokio::test]
async fn test_rotation_uses_live_version() {
    let (fx, user) = with_user(1);
    let d1 = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Web, 1);
    fx.store.set_token_version(&user, 2);

    let outcome = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();

    assert_eq!(outcome, RotationOutcome::Rejected(TokenFailure::InvalidVersion));
}

/// N concurrent first logins from one device converge on one row.
#[tokio::test]
async fn test_concurrent_provisioning_converges() {
    let (fx, user) = with_user(1);
    let request = ProvisionRequest::new(user.clone(), DeviceId::new("new-phone"), Platform::Ios, 1);

    let attempts = (0..10).map(|_| {
        let manager = fx.manager.clone();
        let request = request.clone();
        tokio::spawn(async move {
            manager
                .validate_or_create_device_token(&request, &RequestMetadata::from_ip("203.0.113.9"))
                .await
        })
    });
    let tokens: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().token().cloned().unwrap())
        .collect();

    let rows = fx.store.device_tokens();
    assert_eq!(rows.len(), 1, "❌ Concurrent provisioning created duplicate rows");
    assert!(tokens.iter().all(|t| t.device_token_record_id == rows[0].id));
    assert_eq!(tokens.iter().filter(|t| t.is_new).count(), 1);

    // Every caller's copy is still accepted by the same row.
    for token in &tokens {
        let again = fx
            .manager
            .validate_or_create_device_token(
                &request.clone().with_provided_token(token.device_token.clone()),
                &RequestMetadata::default(),
            )
            .await
            .unwrap();
        let again = again.token().unwrap();
        assert_eq!(again.device_token, token.device_token);
        assert_eq!(again.device_token_record_id, rows[0].id);
    }

    // The first rotation mints the successor, the rest land in its grace period.
    let mut rotations = Vec::new();
    for token in &tokens {
        rotations.push(
            fx.manager
                .rotate_device_token(&token.device_token, &RequestMetadata::default())
                .await
                .unwrap(),
        );
    }
    assert!(rotations[0].new_token().is_some());
    assert!(rotations[1..].iter().all(RotationOutcome::is_grace_period_retry));
    assert!(
        rotations
            .iter()
            .all(|o| o.device_token_id() == rotations[0].device_token_id()),
        "❌ Every caller must land on the same successor"
    );
}

/// A token bound to another device is ignored, not trusted.
#[tokio::test]
async fn test_foreign_device_token_is_not_reused() {
    let (fx, user) = with_user(1);
    let other = fx.seed_device_token(&user, &DeviceId::new("tablet"), Platform::Android, 1);

    let request = ProvisionRequest::new(user.clone(), DeviceId::new("phone"), Platform::Android, 1)
        .with_provided_token(other.clone());
    let outcome = fx
        .manager
        .validate_or_create_device_token(&request, &RequestMetadata::default())
        .await
        .unwrap();

    let token = outcome.token().unwrap();
    assert!(token.is_new);
    assert_ne!(token.device_token, other);
    assert_eq!(fx.manager.list_active_device_tokens(&user).await.unwrap().len(), 2);
}

// ═══════════════════════════════════════════════════════════════════════
// Transport failures
// ═══════════════════════════════════════════════════════════════════════

/// A lock wait that exceeds the timeout is a retryable error, and the
/// presented token is untouched.
#[tokio::test]
async fn test_lock_timeout_is_retryable_and_side_effect_free() {
    init_tracing();
    let store = InMemoryTokenStore::new().with_lock_timeout(std::time::Duration::from_millis(25));
    let fx = fixture(store);
    let user = UserId::new("u1");
    fx.store.insert_user(&user, Role::User, 1);
    let d1 = fx.seed_device_token(&user, &DeviceId::new("d1"), Platform::Web, 1);

    // Another caller is mid-rotation and holds the row.
    let mut blocker = fx.store.begin().await.unwrap();
    let hash = fx.codec.hash_token(&d1);
    assert!(blocker.lock_device_token(&hash).await.unwrap().is_some());

    let err = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap_err();
    assert_eq!(err, LifecycleError::LockTimeout);
    assert!(err.is_retryable());
    drop(blocker);

    let retried = fx
        .manager
        .rotate_device_token(&d1, &RequestMetadata::default())
        .await
        .unwrap();
    assert!(retried.new_token().is_some(), "❌ Original token must still rotate");
}
