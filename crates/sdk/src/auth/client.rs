//! OAuth 2.0 / OIDC client for the contentpass provider.
//!
//! Handles the browser-based authorization-code flow with PKCE, token
//! refresh, subscription validation, and the impression/one-time-token API
//! calls that ride on the session credential.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::pkce::PkceChallenge;
use crate::auth::traits::{AuthUiLauncher, Authorizing, RedirectPayload};
use crate::auth::types::{AuthSession, OAuthErrorBody, TokenResponse};
use crate::config::Configuration;
use crate::entitlement::{EntitlementResponse, EntitlementToken};
use crate::error::{ContentPassError, CountImpressionError};
use crate::impression::SampledImpression;

/// Scopes requested on every authorization.
const SCOPES: &str = "openid offline_access contentpass";

/// Protocol code for a revoked or invalid refresh grant. Refreshing with
/// this outcome is terminal; retrying cannot succeed.
pub const INVALID_GRANT_CODE: i32 = 2002;

/// Protocol code for a user-denied authorization request.
pub const ACCESS_DENIED_CODE: i32 = 1002;

/// Error type for provider interactions.
#[derive(Debug, Error)]
pub enum AuthorizerError {
    /// The OIDC discovery document could not be fetched or parsed.
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),

    /// The provider answered with an OAuth error.
    #[error("provider rejected the request (code {code}): {description}")]
    Protocol { code: i32, description: String },

    /// The HTTP request itself failed.
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// A provider response could not be parsed.
    #[error("response parsing failed: {0}")]
    Parse(String),

    /// The state echoed on redirect did not match the one sent.
    #[error("state mismatch: expected {expected}, received {received}")]
    StateMismatch { expected: String, received: String },

    /// The host could not open the authorization page.
    #[error("authorization page could not be opened: {0}")]
    UiLaunch(String),

    /// The redirect listener closed before delivering a payload.
    #[error("redirect listener closed before a payload arrived")]
    RedirectClosed,
}

impl AuthorizerError {
    /// Whether this error is the terminal invalid-grant outcome.
    #[must_use]
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::Protocol { code, .. } if *code == INVALID_GRANT_CODE)
    }
}

/// Map an authorization-endpoint error identifier to its protocol code.
fn authorization_error_code(error: &str) -> i32 {
    match error {
        "invalid_request" => 1000,
        "unauthorized_client" => 1001,
        "access_denied" => ACCESS_DENIED_CODE,
        "unsupported_response_type" => 1003,
        "invalid_scope" => 1004,
        "server_error" => 1005,
        "temporarily_unavailable" => 1006,
        "client_error" => 1007,
        _ => 1008,
    }
}

/// Map a token-endpoint error identifier to its protocol code.
fn token_error_code(error: &str) -> i32 {
    match error {
        "invalid_request" => 2000,
        "invalid_client" => 2001,
        "invalid_grant" => INVALID_GRANT_CODE,
        "unauthorized_client" => 2003,
        "unsupported_grant_type" => 2004,
        "invalid_scope" => 2005,
        "client_error" => 2006,
        _ => 2007,
    }
}

/// The subset of the OIDC discovery document the client uses.
#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
}

/// One-time-token response from the login endpoint.
#[derive(Debug, Deserialize)]
struct OneTimeTokenResponse {
    #[serde(rename = "oneTimeToken")]
    one_time_token: String,
}

/// OAuth/OIDC client bound to one property configuration.
///
/// The property id doubles as the OAuth client id. Endpoints are resolved
/// lazily from the provider's discovery document and cached for the client's
/// lifetime.
pub struct OAuthClient {
    config: Configuration,
    http: Client,
    discovery: OnceCell<DiscoveryDocument>,
}

impl OAuthClient {
    /// Create a client for the given configuration.
    #[must_use]
    pub fn new(config: Configuration) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { config, http, discovery: OnceCell::new() }
    }

    async fn discovery(&self) -> Result<&DiscoveryDocument, AuthorizerError> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/.well-known/openid-configuration",
                    self.config.oidc_url().as_str().trim_end_matches('/')
                );
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| AuthorizerError::Discovery(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(AuthorizerError::Discovery(format!(
                        "discovery endpoint answered {}",
                        response.status()
                    )));
                }
                response
                    .json::<DiscoveryDocument>()
                    .await
                    .map_err(|e| AuthorizerError::Discovery(e.to_string()))
            })
            .await
    }

    fn api_endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_url().as_str().trim_end_matches('/'))
    }

    /// Build the authorization URL for a browser-based login.
    async fn build_authorization_url(
        &self,
        challenge: &PkceChallenge,
    ) -> Result<String, AuthorizerError> {
        let discovery = self.discovery().await?;

        let params = [
            ("response_type", "code"),
            ("client_id", self.config.property_id()),
            ("redirect_uri", self.config.redirect_uri().as_str()),
            ("scope", SCOPES),
            ("state", &challenge.state),
            ("code_challenge", &challenge.code_challenge),
            ("code_challenge_method", PkceChallenge::method()),
            ("prompt", "consent"),
            ("cp_route", "login"),
        ];

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        Ok(format!("{}?{query}", discovery.authorization_endpoint))
    }

    /// POST a form to the token endpoint and parse the token response.
    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthorizerError> {
        let endpoint = self.discovery().await?.token_endpoint.clone();
        let response = self.http.post(&endpoint).form(form).send().await?;

        if !response.status().is_success() {
            let body: OAuthErrorBody =
                response.json().await.map_err(|e| AuthorizerError::Parse(e.to_string()))?;
            return Err(AuthorizerError::Protocol {
                code: token_error_code(&body.error),
                description: body.error_description.unwrap_or(body.error),
            });
        }

        response.json::<TokenResponse>().await.map_err(|e| AuthorizerError::Parse(e.to_string()))
    }

    /// Refresh when the access token is expired, keeping the credential
    /// usable for the call that follows.
    ///
    /// Returns the credential to use plus the replacement to commit when a
    /// refresh happened.
    async fn ensure_fresh(
        &self,
        session: &AuthSession,
    ) -> Result<(AuthSession, Option<AuthSession>), AuthorizerError> {
        if session.is_access_token_expired() {
            debug!("access token expired, refreshing before API call");
            let next = self.refresh(session).await?;
            Ok((next.clone(), Some(next)))
        } else {
            Ok((session.clone(), None))
        }
    }
}

#[async_trait]
impl Authorizing for OAuthClient {
    async fn authenticate(
        &self,
        launcher: &dyn AuthUiLauncher,
        redirects: &mut mpsc::Receiver<RedirectPayload>,
    ) -> Result<AuthSession, AuthorizerError> {
        let challenge = PkceChallenge::generate();
        let url = self.build_authorization_url(&challenge).await?;

        launcher.launch(&url).map_err(AuthorizerError::UiLaunch)?;

        let payload = redirects.recv().await.ok_or(AuthorizerError::RedirectClosed)?;

        if let Some(error) = payload.error {
            let code = authorization_error_code(&error);
            warn!(code, "authorization request rejected by provider");
            return Err(AuthorizerError::Protocol {
                code,
                description: payload.error_description.unwrap_or(error),
            });
        }

        let received_state = payload.state.unwrap_or_default();
        if received_state != challenge.state {
            return Err(AuthorizerError::StateMismatch {
                expected: challenge.state,
                received: received_state,
            });
        }

        let code = payload
            .code
            .ok_or_else(|| AuthorizerError::Parse("redirect carried no code".to_string()))?;

        let response = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.property_id()),
                ("code", &code),
                ("redirect_uri", self.config.redirect_uri().as_str()),
                ("code_verifier", &challenge.code_verifier),
            ])
            .await?;

        debug!("authorization code exchanged");
        Ok(AuthSession::from_token_response(response))
    }

    async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, AuthorizerError> {
        // A credential without a refresh token cannot be refreshed; this is
        // the same terminal outcome as a revoked grant.
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            return Err(AuthorizerError::Protocol {
                code: INVALID_GRANT_CODE,
                description: "no refresh token available".to_string(),
            });
        };

        let response = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.property_id()),
                ("refresh_token", refresh_token),
            ])
            .await?;

        debug!("token refresh succeeded");
        Ok(AuthSession::refreshed_from(session, response))
    }

    async fn validate_subscription(
        &self,
        session: &AuthSession,
    ) -> Result<bool, ContentPassError> {
        let id_token = session.id_token.as_deref().ok_or_else(|| {
            ContentPassError::Precondition("credential carries no id token".to_string())
        })?;

        let endpoint = self.discovery().await.map_err(ContentPassError::from)?.token_endpoint.clone();
        let response = self
            .http
            .post(&endpoint)
            .form(&[
                ("grant_type", "contentpass_token"),
                ("client_id", self.config.property_id()),
                ("subject_token", id_token),
            ])
            .send()
            .await
            .map_err(AuthorizerError::from)?;

        if !response.status().is_success() {
            let body: OAuthErrorBody = response
                .json()
                .await
                .map_err(|e| AuthorizerError::Parse(e.to_string()))?;
            return Err(AuthorizerError::Protocol {
                code: token_error_code(&body.error),
                description: body.error_description.unwrap_or(body.error),
            }
            .into());
        }

        let body: EntitlementResponse = response
            .json()
            .await
            .map_err(|e| AuthorizerError::Parse(e.to_string()))?;
        let token = EntitlementToken::parse(&body.contentpass_token)?;

        Ok(token.is_valid())
    }

    async fn count_paid_impression(
        &self,
        session: &AuthSession,
    ) -> Result<Option<AuthSession>, ContentPassError> {
        let (current, replacement) = self.ensure_fresh(session).await?;

        let url = format!(
            "{}?pid={}&iid={}&t=pageview",
            self.api_endpoint("pass/hit"),
            urlencoding::encode(self.config.property_id()),
            Uuid::new_v4()
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&current.access_token)
            .send()
            .await
            .map_err(AuthorizerError::from)?;

        // Exactly 200 counts as success; other 2xx codes do not.
        let status = response.status().as_u16();
        if status != 200 {
            return Err(CountImpressionError { status }.into());
        }

        debug!("metered impression counted");
        Ok(replacement)
    }

    async fn report_sampled_impression(&self) -> Result<(), ContentPassError> {
        let payload = SampledImpression::new(self.config.property_id());
        let response = self
            .http
            .post(self.api_endpoint("stats"))
            .json(&payload)
            .send()
            .await
            .map_err(AuthorizerError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CountImpressionError { status: status.as_u16() }.into());
        }

        debug!("sampled impression reported");
        Ok(())
    }

    async fn grab_one_time_token(
        &self,
        session: &AuthSession,
    ) -> Result<(String, Option<AuthSession>), ContentPassError> {
        let (current, replacement) = self.ensure_fresh(session).await?;

        let url = format!(
            "{}?propertyId={}",
            self.api_endpoint("auth/login/ott"),
            urlencoding::encode(self.config.property_id())
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&current.access_token)
            .send()
            .await
            .map_err(AuthorizerError::from)?;

        if !response.status().is_success() {
            return Err(AuthorizerError::Parse(format!(
                "one-time-token endpoint answered {}",
                response.status()
            ))
            .into());
        }

        let body: OneTimeTokenResponse = response
            .json()
            .await
            .map_err(|e| AuthorizerError::Parse(e.to_string()))?;

        Ok((body.one_time_token, replacement))
    }
}
