//! Entitlement token parsing.
//!
//! The subscription validation endpoint returns a compact three-segment token
//! (`header.body.signature`). Header and body are URL-safe base64 JSON; the
//! signature segment is not verified here, that is the issuing server's
//! responsibility. Entitlement decisions are security-relevant, so any
//! malformed segment or missing field is a hard [`ParseError`], never a
//! silent default.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

/// Error type for entitlement token parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Token does not consist of three dot-separated segments.
    #[error("expected a three-segment token, found {0} segments")]
    SegmentCount(usize),

    /// A segment is not valid URL-safe base64.
    #[error("token segment is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A decoded segment is not the expected JSON shape.
    #[error("token segment is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct Header {
    #[allow(dead_code)]
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Body {
    auth: bool,
    plans: Vec<String>,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Parsed entitlement token.
#[derive(Debug, Clone)]
pub struct EntitlementToken {
    /// Whether the token was issued for an authenticated user.
    pub auth: bool,
    /// Subscription plans the user belongs to, in issuance order.
    pub plans: Vec<String>,
    /// Audience (the property the token was issued for).
    pub audience: String,
    /// Issuance time as a unix timestamp.
    pub issued_at: i64,
    /// Expiry time as a unix timestamp.
    pub expires_at: i64,
}

impl EntitlementToken {
    /// Parse a compact three-segment token string.
    ///
    /// # Errors
    /// Returns [`ParseError`] on a wrong segment count, malformed base64, or
    /// a body that misses any required field.
    pub fn parse(token: &str) -> Result<Self, ParseError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(ParseError::SegmentCount(segments.len()));
        }

        // Header is validated for shape even though only the body drives the
        // entitlement decision.
        let _header: Header = decode_segment(segments[0])?;
        let body: Body = decode_segment(segments[1])?;

        Ok(Self {
            auth: body.auth,
            plans: body.plans,
            audience: body.aud,
            issued_at: body.iat,
            expires_at: body.exp,
        })
    }

    /// A subscription is valid when the user is authenticated and belongs to
    /// at least one plan.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.auth && !self.plans.is_empty()
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, ParseError> {
    // Issuers differ on padding; strip it before decoding with the unpadded
    // engine.
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Wire shape of the subscription validation response body.
#[derive(Debug, Deserialize)]
pub(crate) struct EntitlementResponse {
    #[serde(rename = "contentpass_token")]
    pub(crate) contentpass_token: String,
}
