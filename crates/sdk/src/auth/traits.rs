//! Capability traits at the session manager's seams.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::auth::client::AuthorizerError;
use crate::auth::types::{AuthSession, SessionState};
use crate::error::ContentPassError;

/// Query parameters captured from the OAuth redirect URI.
#[derive(Debug, Clone, Default)]
pub struct RedirectPayload {
    /// The one-time authorization code, absent on provider errors.
    pub code: Option<String>,
    /// The state parameter echoed back by the provider.
    pub state: Option<String>,
    /// OAuth error identifier when the provider rejected the request.
    pub error: Option<String>,
    /// Human-readable description accompanying `error`.
    pub error_description: Option<String>,
}

/// Opens the provider's authorization page in a host-supplied surface
/// (system browser, custom tab, embedded web view).
pub trait AuthUiLauncher: Send + Sync {
    /// Present the given authorization URL to the user.
    ///
    /// # Errors
    /// Returns a description when the surface could not be opened.
    fn launch(&self, url: &str) -> Result<(), String>;
}

/// Receives session state changes.
///
/// Observers are invoked synchronously in registration order for every
/// state change, including redundant transitions to the current state. The
/// dispatch happens under the session's state lock, which guarantees that
/// observers see states in commit order; an observer must therefore not
/// call back into the session from within `on_new_state`.
pub trait SessionObserver: Send + Sync {
    /// Called with every newly committed state.
    fn on_new_state(&self, state: &SessionState);
}

/// Everything the session manager needs from the OAuth/API layer.
///
/// The production implementation is [`crate::auth::OAuthClient`]; tests
/// substitute a scripted double.
#[async_trait]
pub trait Authorizing: Send + Sync {
    /// Run the interactive authorization-code flow end to end.
    ///
    /// Launches the authorization page, waits for the redirect payload on
    /// `redirects`, and exchanges the code for tokens.
    ///
    /// # Errors
    /// Returns an error when the user denies, the state check fails, or the
    /// exchange is rejected.
    async fn authenticate(
        &self,
        launcher: &dyn AuthUiLauncher,
        redirects: &mut mpsc::Receiver<RedirectPayload>,
    ) -> Result<AuthSession, AuthorizerError>;

    /// Exchange the refresh token for a successor credential.
    ///
    /// # Errors
    /// Returns [`AuthorizerError::Protocol`] with code 2002 when the grant
    /// was revoked, and transport or protocol errors otherwise.
    async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, AuthorizerError>;

    /// Check whether the credential carries a valid subscription.
    ///
    /// # Errors
    /// Returns an error when the validation exchange or entitlement parse
    /// fails.
    async fn validate_subscription(
        &self,
        session: &AuthSession,
    ) -> Result<bool, ContentPassError>;

    /// Report a metered impression for a subscribed user.
    ///
    /// Returns a replacement credential when the call had to refresh first.
    ///
    /// # Errors
    /// Returns [`crate::error::CountImpressionError`] when the service
    /// answers with anything but 200.
    async fn count_paid_impression(
        &self,
        session: &AuthSession,
    ) -> Result<Option<AuthSession>, ContentPassError>;

    /// Report one sampled anonymous impression.
    ///
    /// # Errors
    /// Returns an error when the stats endpoint rejects the report.
    async fn report_sampled_impression(&self) -> Result<(), ContentPassError>;

    /// Fetch a one-time token for transferring the session to a browser.
    ///
    /// Returns the token plus a replacement credential when the call had to
    /// refresh first.
    ///
    /// # Errors
    /// Returns an error when the token endpoint call fails.
    async fn grab_one_time_token(
        &self,
        session: &AuthSession,
    ) -> Result<(String, Option<AuthSession>), ContentPassError>;
}
