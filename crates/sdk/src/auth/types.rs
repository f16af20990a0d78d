//! Core session types: the credential bundle, the token-endpoint wire shape,
//! and the public session state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ContentPassError;

/// The credential bundle for one logged-in session.
///
/// Exactly one `AuthSession` is live per SDK instance. It is produced by a
/// successful OAuth exchange or by loading the encrypted blob, replaced by
/// every successful refresh, and deleted on logout or after refresh retries
/// are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// Bearer token for the metered API calls.
    pub access_token: String,

    /// Refresh token, absent when the provider did not issue one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// OIDC id token; carries the subject for subscription validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Absolute access-token expiry. Absent means the tokens are treated as
    /// fresh and no refresh timer is armed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_expires_at: Option<DateTime<Utc>>,

    /// Whether the authorization flow completed successfully for this
    /// credential.
    pub authorized: bool,
}

impl AuthSession {
    /// Assemble a credential from its parts.
    #[must_use]
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        id_token: Option<String>,
        access_token_expires_at: Option<DateTime<Utc>>,
        authorized: bool,
    ) -> Self {
        Self { access_token, refresh_token, id_token, access_token_expires_at, authorized }
    }

    /// Build an authorized credential from a token-endpoint response.
    ///
    /// `expires_at` is computed from `expires_in` at construction time.
    #[must_use]
    pub fn from_token_response(response: TokenResponse) -> Self {
        let access_token_expires_at = response
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + Duration::seconds(secs));

        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            access_token_expires_at,
            authorized: true,
        }
    }

    /// Build the successor credential after a refresh.
    ///
    /// Providers may omit the refresh or id token from a refresh response;
    /// the previous credential's values carry over in that case.
    #[must_use]
    pub fn refreshed_from(previous: &Self, response: TokenResponse) -> Self {
        let mut next = Self::from_token_response(response);
        if next.refresh_token.is_none() {
            next.refresh_token = previous.refresh_token.clone();
        }
        if next.id_token.is_none() {
            next.id_token = previous.id_token.clone();
        }
        next
    }

    /// Time remaining until access-token expiry, `None` when no expiry is
    /// set. Negative once the token has expired.
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.access_token_expires_at.map(|at| at - Utc::now())
    }

    /// Whether the access token has expired. Tokens without an expiry are
    /// treated as fresh.
    #[must_use]
    pub fn is_access_token_expired(&self) -> bool {
        matches!(self.time_until_expiry(), Some(remaining) if remaining <= Duration::zero())
    }
}

/// Token response from the provider's token endpoint (RFC 6749).
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
}

/// OAuth error response from the provider (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    pub error_description: Option<String>,
}

/// The session state derived from the current credential.
///
/// Exactly one state is live at a time and every trigger (login, redirect,
/// timer, network completion) ends in exactly one of the four variants.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// The SDK was just created; switches to another state once the stored
    /// credential has been evaluated.
    Initializing,

    /// No valid credential.
    Unauthenticated,

    /// A valid, authorized credential exists. An authenticated user may
    /// still lack an active subscription; check `has_valid_subscription`.
    Authenticated {
        /// Whether the user holds at least one active subscription plan.
        has_valid_subscription: bool,
    },

    /// A recoverable failure occurred while deriving the state (e.g. the
    /// validation call failed on the network). A stored credential may still
    /// exist; `recover_from_error` retries the derivation.
    Error {
        /// The failure that interrupted state derivation.
        cause: Arc<ContentPassError>,
    },
}

impl SessionState {
    /// Whether a user is authenticated in this state.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// Whether this state carries a valid subscription entitlement.
    #[must_use]
    pub fn has_valid_subscription(&self) -> bool {
        matches!(self, Self::Authenticated { has_valid_subscription: true })
    }
}
