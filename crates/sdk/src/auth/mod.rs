//! Session, OAuth, and refresh machinery.
//!
//! The public surface is [`ContentPass`]: it owns the credential, derives
//! [`SessionState`], and drives login, refresh, logout, impressions, and the
//! one-time-token transfer. [`OAuthClient`] talks to the provider;
//! [`Authorizing`] is the seam that lets tests script it.

mod client;
mod pkce;
mod scheduler;
mod session;
mod traits;
mod types;

pub use client::{AuthorizerError, OAuthClient, ACCESS_DENIED_CODE, INVALID_GRANT_CODE};
pub use pkce::PkceChallenge;
pub use scheduler::RefreshScheduler;
pub use session::{ContentPass, ContentPassBuilder, RedirectHandle};
pub use traits::{AuthUiLauncher, Authorizing, RedirectPayload, SessionObserver};
pub use types::{AuthSession, OAuthErrorBody, SessionState, TokenResponse};
