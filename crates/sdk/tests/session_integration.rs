//! End-to-end session state machine tests over a scripted provider.
//!
//! The provider seam is substituted with [`MockAuthorizer`]; timers run on
//! tokio's paused clock so refresh scheduling is deterministic. The startup
//! derivation is spawned by `build()` on the current-thread test runtime, so
//! it only runs once the test reaches its first await point; `settle` drives
//! it to completion.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use contentpass_sdk::auth::{
    AuthorizerError, ContentPass, SessionState, INVALID_GRANT_CODE,
};
use contentpass_sdk::error::{ContentPassError, CountImpressionError};
use contentpass_sdk::security::SecureBlobStore;
use contentpass_sdk::testing::{
    sample_configuration, session_expiring_in, MemoryBlobStore, MockAuthorizer,
    RecordingLauncher, RecordingObserver, StaticKeyProvider,
};

fn draw_never() -> f64 {
    0.9
}

fn draw_always() -> f64 {
    0.0
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(
    blobs: &MemoryBlobStore,
    mock: &Arc<MockAuthorizer>,
    draw: fn() -> f64,
) -> ContentPass {
    init_tracing();
    ContentPass::builder(
        sample_configuration(),
        Box::new(blobs.clone()),
        Box::new(StaticKeyProvider::default()),
    )
    .authorizer(Arc::clone(mock) as Arc<dyn contentpass_sdk::auth::Authorizing>)
    .sampling_draw(draw)
    .build()
}

/// Let the background startup derivation (and any other ready task) run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn seed_store(blobs: &MemoryBlobStore, session: &contentpass_sdk::auth::AuthSession) {
    SecureBlobStore::new(Box::new(blobs.clone()), Box::new(StaticKeyProvider::default()))
        .store(session)
        .unwrap();
}

fn stored_session(blobs: &MemoryBlobStore) -> Option<contentpass_sdk::auth::AuthSession> {
    SecureBlobStore::new(Box::new(blobs.clone()), Box::new(StaticKeyProvider::default()))
        .load()
        .unwrap()
}

/// Validates that construction alone settles the session.
///
/// Assertions:
/// - `build()` returns immediately in `Initializing`.
/// - Without any further call, the state settles on `Unauthenticated` and
///   observers see exactly that transition.
#[tokio::test(start_paused = true)]
async fn construction_settles_in_background() {
    let blobs = MemoryBlobStore::default();
    let mock = Arc::new(MockAuthorizer::default());
    let cp = harness(&blobs, &mock, draw_never);

    let observer = Arc::new(RecordingObserver::default());
    cp.register_observer(observer.clone());
    assert!(matches!(cp.state(), SessionState::Initializing));

    settle().await;

    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    let states = observer.states();
    assert_eq!(states.len(), 1);
    assert!(matches!(states[0], SessionState::Unauthenticated));
    assert_eq!(mock.validate_calls.load(Ordering::SeqCst), 0);
}

/// Validates startup from a stored, unexpired credential.
///
/// Assertions:
/// - The subscription is validated once.
/// - The state is `Authenticated` carrying the validation verdict.
#[tokio::test(start_paused = true)]
async fn valid_stored_credential_authenticates() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(3600));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Ok(true));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    assert!(cp.state().has_valid_subscription());
    assert_eq!(mock.validate_calls.load(Ordering::SeqCst), 1);
}

/// Validates that an authenticated user without plans is still
/// authenticated.
#[tokio::test(start_paused = true)]
async fn authenticated_without_subscription() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(3600));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Ok(false));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    assert!(matches!(
        cp.state(),
        SessionState::Authenticated { has_valid_subscription: false }
    ));
}

/// Validates that an unauthorized stored credential yields
/// `Unauthenticated` without touching the network.
#[tokio::test(start_paused = true)]
async fn unauthorized_credential_is_unauthenticated() {
    let blobs = MemoryBlobStore::default();
    let mut session = session_expiring_in(3600);
    session.authorized = false;
    seed_store(&blobs, &session);
    let mock = Arc::new(MockAuthorizer::default());

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    assert_eq!(mock.validate_calls.load(Ordering::SeqCst), 0);
}

/// Validates that an unreadable blob degrades to the unauthenticated start.
#[tokio::test(start_paused = true)]
async fn corrupt_blob_degrades_to_unauthenticated() {
    use contentpass_sdk::security::BlobStore;

    let blobs = MemoryBlobStore::default();
    blobs.set("contentpass.session", "bm90IGEgYmxvYg==").unwrap();
    blobs.set("contentpass.iv", "AAAAAAAAAAAAAAAA").unwrap();

    let cp = harness(&blobs, &Arc::new(MockAuthorizer::default()), draw_never);
    settle().await;

    assert!(matches!(cp.state(), SessionState::Unauthenticated));
}

/// Validates the error state and recovery from it.
///
/// Assertions:
/// - A failing validation surfaces as `Error` with the cause attached.
/// - `recover_from_error` re-enters `Initializing`, re-runs the derivation,
///   and returns the committed `Authenticated` state.
/// - Observers see `Error`, then `Initializing`, then `Authenticated`.
#[tokio::test(start_paused = true)]
async fn validation_failure_and_recovery() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(3600));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Err(CountImpressionError { status: 503 }.into()));
    mock.push_validation(Ok(true));

    let cp = harness(&blobs, &mock, draw_never);
    let observer = Arc::new(RecordingObserver::default());
    cp.register_observer(observer.clone());
    settle().await;

    match cp.state() {
        SessionState::Error { cause } => {
            assert!(cause.to_string().contains("503"));
        }
        other => panic!("expected error state, got {other:?}"),
    }

    let recovered = cp.recover_from_error().await.unwrap();
    assert!(recovered.has_valid_subscription());
    assert!(cp.state().has_valid_subscription());
    assert_eq!(mock.validate_calls.load(Ordering::SeqCst), 2);

    let states = observer.states();
    assert!(matches!(states[0], SessionState::Error { .. }));
    assert!(matches!(states[1], SessionState::Initializing));
    assert!(matches!(
        states[2],
        SessionState::Authenticated { has_valid_subscription: true }
    ));
}

/// Validates that `recover_from_error` outside the error state is rejected.
#[tokio::test(start_paused = true)]
async fn recover_outside_error_state_is_rejected() {
    let blobs = MemoryBlobStore::default();
    let mock = Arc::new(MockAuthorizer::default());
    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    let err = cp.recover_from_error().await.unwrap_err();
    assert!(matches!(err, ContentPassError::Precondition(_)));
    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    assert_eq!(mock.validate_calls.load(Ordering::SeqCst), 0);
}

/// Validates the interactive login flow end to end.
///
/// Assertions:
/// - The authorization page is launched.
/// - The credential is persisted and the returned state is `Authenticated`.
#[tokio::test(start_paused = true)]
async fn authenticate_persists_and_authenticates() {
    let blobs = MemoryBlobStore::default();
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_authenticate(Ok(session_expiring_in(3600)));
    mock.push_validation(Ok(true));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;
    let _handle = cp.register_redirect_channel();

    let launcher = RecordingLauncher::default();
    let state = cp.authenticate(&launcher).await.unwrap();

    assert_eq!(launcher.urls().len(), 1);
    assert!(state.has_valid_subscription());
    assert!(cp.state().has_valid_subscription());
    assert!(stored_session(&blobs).is_some());
}

/// Validates that a denied login leaves the state untouched.
#[tokio::test(start_paused = true)]
async fn denied_login_keeps_state() {
    let blobs = MemoryBlobStore::default();
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_authenticate(Err(AuthorizerError::Protocol {
        code: 1002,
        description: "access_denied".to_string(),
    }));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;
    let _handle = cp.register_redirect_channel();

    let launcher = RecordingLauncher::default();
    let err = cp.authenticate(&launcher).await.unwrap_err();
    assert!(matches!(
        err,
        ContentPassError::Authorizer(AuthorizerError::Protocol { code: 1002, .. })
    ));
    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    assert!(stored_session(&blobs).is_none());
}

/// Validates the background refresh of an expired stored credential.
///
/// Assertions:
/// - Exactly one refresh runs and its successor is persisted.
/// - The state reaches `Authenticated` only after the refresh settles.
#[tokio::test(start_paused = true)]
async fn expired_credential_refreshes_in_background() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(-60));
    let mock = Arc::new(MockAuthorizer::default());
    let mut next = session_expiring_in(3600);
    next.access_token = "fresh-access".to_string();
    mock.push_refresh(Ok(next));
    mock.push_validation(Ok(true));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(cp.state().has_valid_subscription());
    assert_eq!(stored_session(&blobs).unwrap().access_token, "fresh-access");
}

/// Validates the proactive refresh timer.
///
/// Assertions:
/// - No refresh happens before the expiry.
/// - The timer fires at expiry and the refreshed credential re-arms
///   validation.
#[tokio::test(start_paused = true)]
async fn scheduled_refresh_fires_at_expiry() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(100));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Ok(true));
    mock.push_refresh(Ok(session_expiring_in(3600)));
    mock.push_validation(Ok(true));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(51)).await;
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(cp.state().has_valid_subscription());
}

/// Validates the bounded retry loop with linear backoff.
///
/// Assertions:
/// - Eight attempts run before giving up.
/// - The stored blob is purged and the state becomes `Unauthenticated`.
#[tokio::test(start_paused = true)]
async fn refresh_retries_then_purges() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(-60));
    let mock = Arc::new(MockAuthorizer::default());
    // No scripted refresh results: every attempt fails with a retryable
    // error. Backoff totals 0+10+...+60 = 210 seconds.

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 8);
    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    assert!(stored_session(&blobs).is_none());
}

/// Validates that a revoked grant is terminal without retries.
///
/// Assertions:
/// - Exactly one refresh attempt runs.
/// - The state becomes `Unauthenticated` but the stored blob survives.
#[tokio::test(start_paused = true)]
async fn revoked_grant_is_terminal_and_keeps_blob() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(-60));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_refresh(Err(AuthorizerError::Protocol {
        code: INVALID_GRANT_CODE,
        description: "grant revoked".to_string(),
    }));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    assert!(stored_session(&blobs).is_some());
}

/// Validates that logout clears everything and disarms the timer.
///
/// Assertions:
/// - Credential and blob are gone; the returned state is `Unauthenticated`.
/// - The previously armed refresh timer never fires.
#[tokio::test(start_paused = true)]
async fn logout_clears_session_and_cancels_timer() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(100));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Ok(true));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;
    assert!(cp.state().is_authenticated());

    let state = cp.logout().await.unwrap();
    assert!(matches!(state, SessionState::Unauthenticated));
    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    assert!(stored_session(&blobs).is_none());

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
}

/// Validates that a validation still in flight when logout commits is
/// discarded instead of overwriting the newer state.
///
/// Assertions:
/// - Logout interleaves with an in-flight validation.
/// - The stale `Authenticated` result is never published; the final state
///   stays `Unauthenticated` and observers never see `Authenticated` after
///   it.
#[tokio::test(start_paused = true)]
async fn stale_validation_discarded_after_logout() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(3600));
    let mock = Arc::new(MockAuthorizer::default());
    mock.delay_validation(Duration::from_secs(5));
    mock.push_validation(Ok(true));

    let cp = harness(&blobs, &mock, draw_never);
    let observer = Arc::new(RecordingObserver::default());
    cp.register_observer(observer.clone());

    // Let startup run up to the in-flight validation.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(mock.validate_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(cp.state(), SessionState::Initializing));

    let state = cp.logout().await.unwrap();
    assert!(matches!(state, SessionState::Unauthenticated));

    // The validation completes now; its result belongs to a superseded
    // credential generation.
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(matches!(cp.state(), SessionState::Unauthenticated));
    let states = observer.states();
    assert!(states.iter().all(|s| !s.is_authenticated()));
    assert!(matches!(states.last(), Some(SessionState::Unauthenticated)));
}

/// Validates the metered impression path for a subscriber.
///
/// Assertions:
/// - Exactly one metered hit, no sampled report for a high draw.
/// - A replacement credential from the call is persisted.
#[tokio::test(start_paused = true)]
async fn count_impression_metered_path() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(3600));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Ok(true));
    let mut replacement = session_expiring_in(7200);
    replacement.access_token = "replacement-access".to_string();
    mock.push_count(Ok(Some(replacement)));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    cp.count_impression().await.unwrap();

    assert_eq!(mock.count_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.sampled_calls.load(Ordering::SeqCst), 0);
    assert_eq!(stored_session(&blobs).unwrap().access_token, "replacement-access");
}

/// Validates the sampled anonymous path for a non-subscriber.
#[tokio::test(start_paused = true)]
async fn count_impression_sampled_path() {
    let blobs = MemoryBlobStore::default();
    let mock = Arc::new(MockAuthorizer::default());

    let cp = harness(&blobs, &mock, draw_always);
    settle().await;

    cp.count_impression().await.unwrap();

    assert_eq!(mock.count_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mock.sampled_calls.load(Ordering::SeqCst), 1);
}

/// Validates that a high draw suppresses the sampled report entirely.
#[tokio::test(start_paused = true)]
async fn count_impression_unsampled_is_silent() {
    let blobs = MemoryBlobStore::default();
    let mock = Arc::new(MockAuthorizer::default());

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    cp.count_impression().await.unwrap();

    assert_eq!(mock.count_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mock.sampled_calls.load(Ordering::SeqCst), 0);
}

/// Validates that a metered failure still lets the sampled report run and
/// takes precedence in the returned error.
#[tokio::test(start_paused = true)]
async fn metered_failure_does_not_suppress_sampling() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(3600));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Ok(true));
    mock.push_count(Err(CountImpressionError { status: 403 }.into()));

    let cp = harness(&blobs, &mock, draw_always);
    settle().await;

    let err = cp.count_impression().await.unwrap_err();
    assert!(matches!(
        err,
        ContentPassError::CountImpression(CountImpressionError { status: 403 })
    ));
    assert_eq!(mock.sampled_calls.load(Ordering::SeqCst), 1);
}

/// Validates one-time-token retrieval and the dashboard URL built from it.
#[tokio::test(start_paused = true)]
async fn one_time_token_and_dashboard_url() {
    let blobs = MemoryBlobStore::default();
    seed_store(&blobs, &session_expiring_in(3600));
    let mock = Arc::new(MockAuthorizer::default());
    mock.push_validation(Ok(true));
    mock.push_one_time_token(Ok(("ott-123".to_string(), None)));

    let cp = harness(&blobs, &mock, draw_never);
    settle().await;

    let token = cp.one_time_token().await.unwrap();
    assert_eq!(token, "ott-123");
    assert_eq!(
        cp.dashboard_url(&token),
        "https://api.contentpass.test/auth/login?route=transfer&ott=ott-123"
    );
}

/// Validates that the one-time token requires an active session.
#[tokio::test(start_paused = true)]
async fn one_time_token_requires_session() {
    let blobs = MemoryBlobStore::default();
    let cp = harness(&blobs, &Arc::new(MockAuthorizer::default()), draw_never);
    settle().await;

    let err = cp.one_time_token().await.unwrap_err();
    assert!(matches!(err, ContentPassError::Precondition(_)));
}
