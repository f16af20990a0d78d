//! Test doubles and fixtures.
//!
//! In-memory implementations of the storage capabilities, a scripted
//! [`Authorizing`] double, and fixture helpers. Used by the unit and
//! integration tests; hosts can reuse them for their own tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::auth::{
    AuthSession, AuthUiLauncher, AuthorizerError, Authorizing, RedirectPayload, SessionObserver,
    SessionState,
};
use crate::config::Configuration;
use crate::error::ContentPassError;
use crate::security::{BlobStore, KeyProvider, StoreError};

/// A configuration pointing at test hosts.
///
/// # Panics
/// Panics when the embedded fixture is invalid; test-only code.
#[must_use]
pub fn sample_configuration() -> Configuration {
    Configuration::from_json(
        r#"{
            "schema_version": 1,
            "api_url": "https://api.contentpass.test",
            "oidc_url": "https://oidc.contentpass.test",
            "redirect_uri": "app://oauth/callback",
            "property_id": "f81acd98-6582-4e56-9d2a-0d5ad25f1d62"
        }"#,
    )
    .unwrap()
}

/// An authorized credential expiring `secs` seconds from now. Negative
/// values produce an already expired credential.
#[must_use]
pub fn session_expiring_in(secs: i64) -> AuthSession {
    AuthSession::new(
        "access-token".to_string(),
        Some("refresh-token".to_string()),
        Some("id-token".to_string()),
        Some(Utc::now() + Duration::seconds(secs)),
        true,
    )
}

/// In-memory [`BlobStore`]. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// [`KeyProvider`] returning a fixed key.
pub struct StaticKeyProvider {
    key: [u8; 32],
}

impl StaticKeyProvider {
    /// Provider returning the given key.
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl Default for StaticKeyProvider {
    fn default() -> Self {
        Self::new([42u8; 32])
    }
}

impl KeyProvider for StaticKeyProvider {
    fn provide_key(&self) -> Result<[u8; 32], StoreError> {
        Ok(self.key)
    }
}

/// [`KeyProvider`] that always fails, for unavailable-key-store scenarios.
#[derive(Default)]
pub struct FailingKeyProvider;

impl KeyProvider for FailingKeyProvider {
    fn provide_key(&self) -> Result<[u8; 32], StoreError> {
        Err(StoreError::Key("key store unavailable".to_string()))
    }
}

/// Observer that records every published state.
#[derive(Default)]
pub struct RecordingObserver {
    states: Mutex<Vec<SessionState>>,
}

impl RecordingObserver {
    /// All states observed so far, in order.
    #[must_use]
    pub fn states(&self) -> Vec<SessionState> {
        self.states.lock().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_new_state(&self, state: &SessionState) {
        self.states.lock().push(state.clone());
    }
}

/// Launcher that records the URLs it was asked to open.
#[derive(Default)]
pub struct RecordingLauncher {
    urls: Mutex<Vec<String>>,
}

impl RecordingLauncher {
    /// All launched URLs, in order.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

impl AuthUiLauncher for RecordingLauncher {
    fn launch(&self, url: &str) -> Result<(), String> {
        self.urls.lock().push(url.to_string());
        Ok(())
    }
}

/// Scripted [`Authorizing`] double.
///
/// Each operation pops its next scripted result; an empty script falls back
/// to a benign default (`Ok(true)` for validation, `Ok(None)` for metered
/// impressions, an error for refresh and authenticate). Call counters allow
/// asserting how often each operation ran.
#[derive(Default)]
pub struct MockAuthorizer {
    authenticate_results: Mutex<VecDeque<Result<AuthSession, AuthorizerError>>>,
    refresh_results: Mutex<VecDeque<Result<AuthSession, AuthorizerError>>>,
    validate_results: Mutex<VecDeque<Result<bool, ContentPassError>>>,
    validate_delay: Mutex<Option<std::time::Duration>>,
    count_results: Mutex<VecDeque<Result<Option<AuthSession>, ContentPassError>>>,
    sampled_results: Mutex<VecDeque<Result<(), ContentPassError>>>,
    ott_results: Mutex<VecDeque<Result<(String, Option<AuthSession>), ContentPassError>>>,

    /// Number of `refresh` invocations.
    pub refresh_calls: AtomicUsize,
    /// Number of `validate_subscription` invocations.
    pub validate_calls: AtomicUsize,
    /// Number of `count_paid_impression` invocations.
    pub count_calls: AtomicUsize,
    /// Number of `report_sampled_impression` invocations.
    pub sampled_calls: AtomicUsize,
}

impl MockAuthorizer {
    /// Script the next `authenticate` outcome.
    pub fn push_authenticate(&self, result: Result<AuthSession, AuthorizerError>) {
        self.authenticate_results.lock().push_back(result);
    }

    /// Script the next `refresh` outcome.
    pub fn push_refresh(&self, result: Result<AuthSession, AuthorizerError>) {
        self.refresh_results.lock().push_back(result);
    }

    /// Script the next `validate_subscription` outcome.
    pub fn push_validation(&self, result: Result<bool, ContentPassError>) {
        self.validate_results.lock().push_back(result);
    }

    /// Make every `validate_subscription` call sleep first, so tests can
    /// interleave other operations with an in-flight validation.
    pub fn delay_validation(&self, delay: std::time::Duration) {
        *self.validate_delay.lock() = Some(delay);
    }

    /// Script the next `count_paid_impression` outcome.
    pub fn push_count(&self, result: Result<Option<AuthSession>, ContentPassError>) {
        self.count_results.lock().push_back(result);
    }

    /// Script the next `report_sampled_impression` outcome.
    pub fn push_sampled(&self, result: Result<(), ContentPassError>) {
        self.sampled_results.lock().push_back(result);
    }

    /// Script the next `grab_one_time_token` outcome.
    pub fn push_one_time_token(
        &self,
        result: Result<(String, Option<AuthSession>), ContentPassError>,
    ) {
        self.ott_results.lock().push_back(result);
    }
}

#[async_trait]
impl Authorizing for MockAuthorizer {
    async fn authenticate(
        &self,
        launcher: &dyn AuthUiLauncher,
        _redirects: &mut mpsc::Receiver<RedirectPayload>,
    ) -> Result<AuthSession, AuthorizerError> {
        launcher
            .launch("https://oidc.contentpass.test/authorize")
            .map_err(AuthorizerError::UiLaunch)?;
        self.authenticate_results
            .lock()
            .pop_front()
            .unwrap_or(Err(AuthorizerError::RedirectClosed))
    }

    async fn refresh(&self, _session: &AuthSession) -> Result<AuthSession, AuthorizerError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_results.lock().pop_front().unwrap_or_else(|| {
            Err(AuthorizerError::Protocol {
                code: 2007,
                description: "unscripted refresh".to_string(),
            })
        })
    }

    async fn validate_subscription(
        &self,
        _session: &AuthSession,
    ) -> Result<bool, ContentPassError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.validate_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.validate_results.lock().pop_front().unwrap_or(Ok(true))
    }

    async fn count_paid_impression(
        &self,
        _session: &AuthSession,
    ) -> Result<Option<AuthSession>, ContentPassError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        self.count_results.lock().pop_front().unwrap_or(Ok(None))
    }

    async fn report_sampled_impression(&self) -> Result<(), ContentPassError> {
        self.sampled_calls.fetch_add(1, Ordering::SeqCst);
        self.sampled_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn grab_one_time_token(
        &self,
        _session: &AuthSession,
    ) -> Result<(String, Option<AuthSession>), ContentPassError> {
        self.ott_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(("one-time-token".to_string(), None)))
    }
}
