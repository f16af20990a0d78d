//! Top-level error composition for the SDK.
//!
//! Each module defines its own error enum close to the code that produces it
//! ([`AuthorizerError`](crate::auth::AuthorizerError) in the OAuth client,
//! [`StoreError`](crate::security::StoreError) in the blob store,
//! [`ParseError`](crate::entitlement::ParseError) in the entitlement parser,
//! [`ConfigError`](crate::config::ConfigError) in configuration loading).
//! `ContentPassError` composes them so the session state machine and its
//! callers deal with a single error surface.

use thiserror::Error;

use crate::auth::AuthorizerError;
use crate::config::ConfigError;
use crate::entitlement::ParseError;
use crate::security::StoreError;

/// A metered or sampled impression request was rejected by the server.
#[derive(Debug, Error)]
#[error("impression request rejected with status {status}")]
pub struct CountImpressionError {
    /// HTTP status code returned by the metering or stats endpoint.
    pub status: u16,
}

/// Unified error type surfaced by [`ContentPass`](crate::auth::ContentPass).
#[derive(Debug, Error)]
pub enum ContentPassError {
    /// OAuth protocol, discovery, or transport failure.
    #[error(transparent)]
    Authorizer(#[from] AuthorizerError),

    /// Encrypted credential storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Entitlement token could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Impression counting was rejected by the server.
    #[error(transparent)]
    CountImpression(#[from] CountImpressionError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// API misuse, e.g. `authenticate` before registering a redirect channel.
    #[error("precondition violated: {0}")]
    Precondition(String),
}
