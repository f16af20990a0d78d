//! Client-side session and entitlement manager for the contentpass
//! subscription service.
//!
//! The SDK logs a user in through the provider's browser-based OAuth flow,
//! keeps the resulting credential encrypted at rest, refreshes it ahead of
//! expiry, answers whether the user holds a valid subscription, and reports
//! content impressions (metered for subscribers, sampled anonymously for a
//! small fraction of all traffic).
//!
//! # Quick start
//!
//! ```no_run
//! use contentpass_sdk::auth::ContentPass;
//! use contentpass_sdk::config::Configuration;
//! use contentpass_sdk::testing::{MemoryBlobStore, StaticKeyProvider};
//!
//! # async fn example() -> Result<(), contentpass_sdk::error::ContentPassError> {
//! let config = Configuration::from_json(
//!     r#"{
//!         "schema_version": 1,
//!         "base_url": "https://my.contentpass.net",
//!         "redirect_uri": "app://oauth/callback",
//!         "property_id": "00000000-0000-0000-0000-000000000000"
//!     }"#,
//! )?;
//!
//! let contentpass = ContentPass::builder(
//!     config,
//!     Box::new(MemoryBlobStore::default()),
//!     Box::new(StaticKeyProvider::default()),
//! )
//! .build();
//! // The stored credential is evaluated in the background; the session
//! // settles out of `Initializing` without further calls.
//!
//! if contentpass.state().has_valid_subscription() {
//!     contentpass.count_impression().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod auth;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod impression;
pub mod security;
pub mod testing;

pub use auth::{
    AuthSession, AuthUiLauncher, ContentPass, ContentPassBuilder, RedirectHandle,
    RedirectPayload, SessionObserver, SessionState,
};
pub use config::Configuration;
pub use error::{ContentPassError, CountImpressionError};
