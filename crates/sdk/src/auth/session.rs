//! The session state machine.
//!
//! [`ContentPass`] owns the single live credential, derives the public
//! [`SessionState`] from it, and coordinates the triggers that can change it:
//! interactive login, the proactive refresh timer, API calls that refreshed
//! on the side, logout, and error recovery.
//!
//! Concurrency model: the credential sits behind an async mutex together
//! with a generation counter, and every state publication happens while that
//! mutex is held. Every credential replacement bumps the generation;
//! asynchronous completions (timers, refresh loops) check the generation
//! they started from and publish in the same serialized step, so a stale
//! completion can never overwrite a newer state. The state write and the
//! synchronous in-order observer dispatch happen under the state cell's own
//! lock. Nothing holds a lock across a network call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::scheduler::RefreshScheduler;
use crate::auth::traits::{AuthUiLauncher, Authorizing, RedirectPayload, SessionObserver};
use crate::auth::types::{AuthSession, SessionState};
use crate::auth::OAuthClient;
use crate::config::Configuration;
use crate::error::ContentPassError;
use crate::impression::should_report;
use crate::security::{BlobStore, KeyProvider, SecureBlobStore, StoreError};

/// Total refresh attempts after the first failure: 7 retries, 8 attempts.
const MAX_REFRESH_RETRIES: u32 = 7;
/// Backoff step between retries; attempt `n` waits `n * 10` seconds.
const RETRY_BACKOFF_STEP_SECS: u64 = 10;
/// Buffered redirect payloads; one in-flight flow needs only one.
const REDIRECT_CHANNEL_CAPACITY: usize = 4;

struct SessionCell {
    state: SessionState,
    observers: Vec<Arc<dyn SessionObserver>>,
}

struct SessionInner {
    authorizer: Arc<dyn Authorizing>,
    store: SecureBlobStore,
    config: Configuration,
    cell: Mutex<SessionCell>,
    credential: tokio::sync::Mutex<Option<AuthSession>>,
    generation: AtomicU64,
    scheduler: RefreshScheduler,
    redirect_rx: Mutex<Option<mpsc::Receiver<RedirectPayload>>>,
    sampling_draw: fn() -> f64,
}

/// Delivers OAuth redirect payloads into a waiting [`authenticate`] call.
///
/// [`authenticate`]: ContentPass::authenticate
#[derive(Clone)]
pub struct RedirectHandle {
    tx: mpsc::Sender<RedirectPayload>,
}

impl RedirectHandle {
    /// Forward a captured redirect. Returns `false` when no flow is waiting.
    pub async fn deliver(&self, payload: RedirectPayload) -> bool {
        self.tx.send(payload).await.is_ok()
    }
}

/// Client-side session and entitlement manager for one property.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct ContentPass {
    inner: Arc<SessionInner>,
}

/// Builder for [`ContentPass`].
pub struct ContentPassBuilder {
    config: Configuration,
    blobs: Box<dyn BlobStore>,
    keys: Box<dyn KeyProvider>,
    authorizer: Option<Arc<dyn Authorizing>>,
    sampling_draw: fn() -> f64,
}

impl ContentPassBuilder {
    /// Substitute the provider client. Intended for tests.
    #[must_use]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizing>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Substitute the sampling draw. Intended for deterministic tests.
    #[must_use]
    pub fn sampling_draw(mut self, draw: fn() -> f64) -> Self {
        self.sampling_draw = draw;
        self
    }

    /// Assemble the manager and spawn the startup derivation.
    ///
    /// The session starts in [`SessionState::Initializing`] and settles in
    /// the background once the stored credential has been evaluated; no
    /// further call is needed.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime, which is required for the
    /// background derivation.
    #[must_use]
    pub fn build(self) -> ContentPass {
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(OAuthClient::new(self.config.clone())));

        let contentpass = ContentPass {
            inner: Arc::new(SessionInner {
                authorizer,
                store: SecureBlobStore::new(self.blobs, self.keys),
                config: self.config,
                cell: Mutex::new(SessionCell {
                    state: SessionState::Initializing,
                    observers: Vec::new(),
                }),
                credential: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                scheduler: RefreshScheduler::new(),
                redirect_rx: Mutex::new(None),
                sampling_draw: self.sampling_draw,
            }),
        };

        let startup = contentpass.clone();
        tokio::spawn(async move {
            startup.startup().await;
        });

        contentpass
    }
}

impl SessionInner {
    /// Write a new state and notify observers in registration order.
    ///
    /// The write and the dispatch happen under the cell lock, so observers
    /// always see states in commit order. Redundant transitions are
    /// published like any other. Callers serialize publication through the
    /// credential mutex.
    fn set_state(&self, state: SessionState) {
        debug!(state = ?state, "session state changed");
        let mut cell = self.cell.lock();
        cell.state = state.clone();
        for observer in &cell.observers {
            observer.on_new_state(&state);
        }
    }

    /// Publish a state unrelated to any credential change.
    ///
    /// Holds the credential mutex so the publication cannot interleave with
    /// a concurrent commit.
    async fn publish(&self, state: SessionState) {
        let _guard = self.credential.lock().await;
        self.set_state(state);
    }

    /// Publish a state only if `expected` is still the live generation.
    ///
    /// Generation check and publication are one serialized step under the
    /// credential mutex. Returns whether the state was published.
    async fn publish_if_current(&self, expected: u64, state: SessionState) -> bool {
        let _guard = self.credential.lock().await;
        if self.generation.load(Ordering::Acquire) != expected {
            debug!(expected, "discarding stale state publication");
            return false;
        }
        self.set_state(state);
        true
    }

    /// Snapshot the credential together with the generation it belongs to.
    async fn snapshot(&self) -> (Option<AuthSession>, u64) {
        let guard = self.credential.lock().await;
        (guard.clone(), self.generation.load(Ordering::Acquire))
    }

    /// Replace the credential unconditionally. Returns the new generation.
    async fn commit(&self, session: Option<AuthSession>) -> u64 {
        let mut guard = self.credential.lock().await;
        *guard = session;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Replace the credential and publish a state in one serialized step.
    async fn commit_and_publish(&self, session: Option<AuthSession>, state: SessionState) -> u64 {
        let mut guard = self.credential.lock().await;
        *guard = session;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_state(state);
        drop(guard);
        generation
    }

    /// Replace the credential only if `expected` is still the live
    /// generation. Returns the new generation, or `None` when the completion
    /// was stale.
    async fn commit_if_current(
        &self,
        expected: u64,
        session: Option<AuthSession>,
    ) -> Option<u64> {
        let mut guard = self.credential.lock().await;
        if self.generation.load(Ordering::Acquire) != expected {
            debug!(expected, "discarding stale credential commit");
            return None;
        }
        *guard = session;
        Some(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Guarded commit plus state publication in one serialized step.
    async fn commit_and_publish_if_current(
        &self,
        expected: u64,
        session: Option<AuthSession>,
        state: SessionState,
    ) -> Option<u64> {
        let mut guard = self.credential.lock().await;
        if self.generation.load(Ordering::Acquire) != expected {
            debug!(expected, "discarding stale credential commit");
            return None;
        }
        *guard = session;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_state(state);
        drop(guard);
        Some(generation)
    }

    /// Persist and adopt a credential, then derive and publish the state.
    async fn apply_session(self: &Arc<Self>, session: AuthSession) {
        if let Err(err) = self.store.store(&session) {
            warn!(error = %err, "credential could not be persisted");
            self.publish(SessionState::Error { cause: Arc::new(err.into()) }).await;
            return;
        }

        let generation = self.commit(Some(session.clone())).await;
        self.derive_and_publish(session, generation).await;
    }

    /// Derive the public state from an already committed credential.
    ///
    /// An expired credential triggers an immediate background refresh and
    /// leaves the current state in place until the refresh settles. A future
    /// expiry arms the proactive refresh timer before validation.
    fn derive_and_publish<'a>(
        self: &'a Arc<Self>,
        session: AuthSession,
        generation: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        // Boxed to break the async recursion cycle through
        // `refresh_with_retry`.
        Box::pin(async move {
        if !session.authorized {
            self.publish_if_current(generation, SessionState::Unauthenticated).await;
            return;
        }

        match session.time_until_expiry() {
            Some(remaining) if remaining <= chrono::Duration::zero() => {
                debug!("stored credential expired, refreshing in background");
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.refresh_with_retry(generation).await;
                });
                return;
            }
            Some(remaining) => {
                let delay = remaining.to_std().unwrap_or_default();
                let inner = Arc::clone(self);
                self.scheduler.arm(delay, move || async move {
                    inner.refresh_with_retry(generation).await;
                });
            }
            None => {}
        }

        // The validation runs without holding the credential lock; the
        // guarded publication discards the result if a concurrent logout or
        // re-login superseded this credential in the meantime.
        match self.authorizer.validate_subscription(&session).await {
            Ok(has_valid_subscription) => {
                self.publish_if_current(
                    generation,
                    SessionState::Authenticated { has_valid_subscription },
                )
                .await;
            }
            Err(cause) => {
                warn!(error = %cause, "subscription validation failed");
                self.publish_if_current(generation, SessionState::Error { cause: Arc::new(cause) })
                    .await;
            }
        }
        })
    }

    /// Refresh the credential, retrying with linear backoff.
    ///
    /// Attempt `n` (zero-based) waits `n * 10` seconds after a failure, up
    /// to 7 retries. A revoked grant (code 2002) is terminal immediately and
    /// keeps the stored blob; exhausting the retries deletes it. Completions
    /// from a superseded generation are discarded.
    async fn refresh_with_retry(self: Arc<Self>, generation: u64) {
        for attempt in 0..=MAX_REFRESH_RETRIES {
            let (session, current) = self.snapshot().await;
            if current != generation {
                debug!("refresh superseded, giving up");
                return;
            }
            let Some(session) = session else {
                return;
            };

            match self.authorizer.refresh(&session).await {
                Ok(next) => {
                    if let Err(err) = self.store.store(&next) {
                        warn!(error = %err, "refreshed credential could not be persisted");
                        self.publish_if_current(
                            generation,
                            SessionState::Error { cause: Arc::new(err.into()) },
                        )
                        .await;
                        return;
                    }
                    let Some(new_generation) =
                        self.commit_if_current(generation, Some(next.clone())).await
                    else {
                        return;
                    };
                    info!(attempt, "token refresh succeeded");
                    self.derive_and_publish(next, new_generation).await;
                    return;
                }
                Err(err) if err.is_invalid_grant() => {
                    // The grant is gone; retrying cannot help. The blob stays
                    // in place so a later login on the same device can be
                    // diagnosed against it.
                    warn!("refresh grant revoked, session is unauthenticated");
                    if self.publish_if_current(generation, SessionState::Unauthenticated).await {
                        self.scheduler.cancel();
                    }
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "token refresh failed");
                    if attempt < MAX_REFRESH_RETRIES {
                        let backoff =
                            Duration::from_secs(u64::from(attempt) * RETRY_BACKOFF_STEP_SECS);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        // Retries exhausted: drop the credential entirely.
        warn!("refresh retries exhausted, purging stored credential");
        if let Err(err) = self.store.delete() {
            warn!(error = %err, "stored credential could not be deleted");
        }
        if self
            .commit_and_publish_if_current(generation, None, SessionState::Unauthenticated)
            .await
            .is_some()
        {
            self.scheduler.cancel();
        }
    }

    /// Adopt a replacement credential produced as a side effect of an API
    /// call, re-arming the refresh timer for its expiry.
    async fn adopt_replacement(self: &Arc<Self>, generation: u64, session: AuthSession) {
        if let Err(err) = self.store.store(&session) {
            warn!(error = %err, "replacement credential could not be persisted");
            return;
        }
        let Some(new_generation) = self.commit_if_current(generation, Some(session.clone())).await
        else {
            return;
        };
        if let Some(remaining) = session.time_until_expiry() {
            if remaining > chrono::Duration::zero() {
                let delay = remaining.to_std().unwrap_or_default();
                let inner = Arc::clone(self);
                self.scheduler.arm(delay, move || async move {
                    inner.refresh_with_retry(new_generation).await;
                });
            }
        }
    }
}

impl ContentPass {
    /// Start building a manager for the given configuration and storage
    /// capabilities.
    #[must_use]
    pub fn builder(
        config: Configuration,
        blobs: Box<dyn BlobStore>,
        keys: Box<dyn KeyProvider>,
    ) -> ContentPassBuilder {
        ContentPassBuilder {
            config,
            blobs,
            keys,
            authorizer: None,
            sampling_draw: rand::random::<f64>,
        }
    }

    /// Evaluate the stored credential and leave
    /// [`SessionState::Initializing`]. Spawned by the builder.
    ///
    /// An unreadable blob (corrupt, or written with a lost key) is treated
    /// as "no stored credential".
    async fn startup(&self) {
        match self.inner.store.load() {
            Ok(Some(session)) => {
                self.inner.apply_session(session).await;
            }
            Ok(None) => {
                self.inner.publish(SessionState::Unauthenticated).await;
            }
            Err(StoreError::Decryption) => {
                warn!("stored credential unreadable, starting unauthenticated");
                self.inner.publish(SessionState::Unauthenticated).await;
            }
            Err(err) => {
                self.inner
                    .publish(SessionState::Error { cause: Arc::new(err.into()) })
                    .await;
            }
        }
    }

    /// The current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.cell.lock().state.clone()
    }

    /// Register an observer for state changes.
    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner.cell.lock().observers.push(observer);
    }

    /// Remove a previously registered observer.
    pub fn unregister_observer(&self, observer: &Arc<dyn SessionObserver>) {
        self.inner.cell.lock().observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Register the channel that delivers OAuth redirect payloads.
    ///
    /// Replaces any previously registered channel.
    #[must_use]
    pub fn register_redirect_channel(&self) -> RedirectHandle {
        let (tx, rx) = mpsc::channel(REDIRECT_CHANNEL_CAPACITY);
        *self.inner.redirect_rx.lock() = Some(rx);
        RedirectHandle { tx }
    }

    /// Run the interactive login flow.
    ///
    /// Opens the authorization page through `launcher`, waits for the
    /// redirect delivered via the registered [`RedirectHandle`], exchanges
    /// the code, and publishes the resulting state, which is also returned.
    ///
    /// # Errors
    /// Returns [`ContentPassError::Precondition`] when no redirect channel
    /// is registered, and provider errors otherwise. The state is left
    /// unchanged on failure.
    pub async fn authenticate(
        &self,
        launcher: &dyn AuthUiLauncher,
    ) -> Result<SessionState, ContentPassError> {
        let Some(mut rx) = self.inner.redirect_rx.lock().take() else {
            return Err(ContentPassError::Precondition(
                "no redirect channel registered".to_string(),
            ));
        };

        let result = self.inner.authorizer.authenticate(launcher, &mut rx).await;
        *self.inner.redirect_rx.lock() = Some(rx);

        let session = result?;
        info!("interactive login completed");
        self.inner.apply_session(session).await;
        Ok(self.state())
    }

    /// Drop the session: cancel the refresh timer, clear the credential,
    /// publish `Unauthenticated`, and delete the stored blob. Returns the
    /// committed state.
    ///
    /// # Errors
    /// Returns a storage error when the blob could not be deleted; the
    /// in-memory session is cleared regardless.
    pub async fn logout(&self) -> Result<SessionState, ContentPassError> {
        self.inner.scheduler.cancel();
        self.inner.commit_and_publish(None, SessionState::Unauthenticated).await;
        let result = self.inner.store.delete();
        info!("logged out");
        result?;
        Ok(self.state())
    }

    /// Report one content impression.
    ///
    /// Subscribed users produce a metered hit; independently, a small sample
    /// of all calls produces an anonymous report. Both paths run even when
    /// the metered one fails; the metered error takes precedence.
    ///
    /// # Errors
    /// Returns [`crate::error::CountImpressionError`] when either report was
    /// rejected by the server.
    pub async fn count_impression(&self) -> Result<(), ContentPassError> {
        let metered = if self.state().has_valid_subscription() {
            let (session, generation) = self.inner.snapshot().await;
            match session {
                Some(session) => match self.inner.authorizer.count_paid_impression(&session).await
                {
                    Ok(Some(replacement)) => {
                        self.inner.adopt_replacement(generation, replacement).await;
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                },
                None => Ok(()),
            }
        } else {
            Ok(())
        };

        let sampled = if should_report((self.inner.sampling_draw)()) {
            self.inner.authorizer.report_sampled_impression().await
        } else {
            Ok(())
        };

        metered?;
        sampled
    }

    /// Retry state derivation after a failure.
    ///
    /// Re-enters [`SessionState::Initializing`], re-runs the derivation from
    /// the live credential (or the stored one when none is in memory), and
    /// returns the state committed by the time the derivation settled.
    ///
    /// # Errors
    /// Returns [`ContentPassError::Precondition`] when the session is not in
    /// [`SessionState::Error`].
    pub async fn recover_from_error(&self) -> Result<SessionState, ContentPassError> {
        if !matches!(self.state(), SessionState::Error { .. }) {
            return Err(ContentPassError::Precondition(
                "session is not in the error state".to_string(),
            ));
        }

        self.inner.publish(SessionState::Initializing).await;

        let (session, _) = self.inner.snapshot().await;
        match session {
            Some(session) => self.inner.apply_session(session).await,
            None => self.startup().await,
        }
        Ok(self.state())
    }

    /// Fetch a one-time token for transferring the session to a browser.
    ///
    /// # Errors
    /// Returns [`ContentPassError::Precondition`] when no user is logged in,
    /// and provider errors otherwise.
    pub async fn one_time_token(&self) -> Result<String, ContentPassError> {
        let (session, generation) = self.inner.snapshot().await;
        let Some(session) = session else {
            return Err(ContentPassError::Precondition("no active session".to_string()));
        };

        let (token, replacement) = self.inner.authorizer.grab_one_time_token(&session).await?;
        if let Some(replacement) = replacement {
            self.inner.adopt_replacement(generation, replacement).await;
        }
        Ok(token)
    }

    /// Build the subscriber dashboard URL for a one-time token.
    #[must_use]
    pub fn dashboard_url(&self, one_time_token: &str) -> String {
        format!(
            "{}/auth/login?route=transfer&ott={}",
            self.inner.config.api_url().as_str().trim_end_matches('/'),
            urlencoding::encode(one_time_token)
        )
    }
}
