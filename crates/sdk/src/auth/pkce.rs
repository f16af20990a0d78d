//! PKCE challenge generation for the authorization-code flow (RFC 7636).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length in bytes of the random material behind the code verifier.
const VERIFIER_ENTROPY_LEN: usize = 32;
/// Length in bytes of the random material behind the state parameter.
const STATE_ENTROPY_LEN: usize = 16;

/// One-shot PKCE material for a single authorization request.
///
/// The verifier and state are held only for the duration of the flow and
/// discarded after the code exchange.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// High-entropy secret sent with the code exchange.
    pub code_verifier: String,
    /// S256 digest of the verifier, sent with the authorization request.
    pub code_challenge: String,
    /// CSRF token echoed back by the provider on redirect.
    pub state: String,
}

impl PkceChallenge {
    /// Generate fresh PKCE material from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; VERIFIER_ENTROPY_LEN];
        OsRng.fill_bytes(&mut verifier_bytes);
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let digest = Sha256::digest(code_verifier.as_bytes());
        let code_challenge = URL_SAFE_NO_PAD.encode(digest);

        let mut state_bytes = [0u8; STATE_ENTROPY_LEN];
        OsRng.fill_bytes(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        Self { code_verifier, code_challenge, state }
    }

    /// The challenge method advertised to the provider.
    #[must_use]
    pub fn method() -> &'static str {
        "S256"
    }
}
