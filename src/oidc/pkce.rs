//! PKCE (Proof Key for Code Exchange) implementation
//!
//! Implements RFC 7636 S256 for the authorization code flow. The same
//! generator also produces the `state` and `nonce` values, each from an
//! independent draw of the OS randomness source.

use crate::error::{AuthError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Bytes of entropy behind every verifier, state and nonce (43 base64url chars).
pub const RANDOM_BYTES: usize = 32;

/// PKCE parameters for OAuth 2.0 authorization code flow
#[derive(Clone)]
pub struct PkceParams {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkceParams {
    /// Generate a fresh verifier and its S256 challenge
    pub fn generate() -> Result<Self> {
        let code_verifier = generate_verifier()?;
        let code_challenge = derive_challenge(&code_verifier);

        Ok(PkceParams {
            code_verifier,
            code_challenge,
        })
    }
}

impl std::fmt::Debug for PkceParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceParams")
            .field("code_verifier", &"[REDACTED]")
            .field("code_challenge", &self.code_challenge)
            .finish()
    }
}

/// Generate a code verifier from the OS randomness source.
///
/// There is no fallback to a userspace PRNG: if the OS source cannot be read
/// the flow must not start.
pub fn generate_verifier() -> Result<String> {
    let mut bytes = [0u8; RANDOM_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AuthError::Entropy(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn derive_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Random `state` parameter for CSRF protection
pub fn generate_state() -> Result<String> {
    generate_verifier()
}

/// Random `nonce` echoed back inside the ID token
pub fn generate_nonce() -> Result<String> {
    generate_verifier()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_base64url(value: &str) -> bool {
        value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn test_pkce_generation() {
        let pkce = PkceParams::generate().unwrap();

        // 32 bytes -> 43 base64url chars, no padding
        assert_eq!(pkce.code_verifier.len(), 43);
        assert!(is_base64url(&pkce.code_verifier));

        // SHA256 digest encoded in base64url is also 43 chars
        assert_eq!(pkce.code_challenge.len(), 43);
        assert!(is_base64url(&pkce.code_challenge));
    }

    #[test]
    fn test_pkce_uniqueness() {
        let pkce1 = PkceParams::generate().unwrap();
        let pkce2 = PkceParams::generate().unwrap();

        assert_ne!(pkce1.code_verifier, pkce2.code_verifier);
        assert_ne!(pkce1.code_challenge, pkce2.code_challenge);
    }

    #[test]
    fn test_challenge_is_deterministic_and_differs_from_verifier() {
        for _ in 0..32 {
            let verifier = generate_verifier().unwrap();
            let challenge = derive_challenge(&verifier);
            assert_eq!(challenge, derive_challenge(&verifier));
            assert_ne!(challenge, verifier);
        }
    }

    #[test]
    fn test_challenge_matches_rfc7636_vector() {
        // RFC 7636 Appendix B
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            derive_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_state_and_nonce_are_independent() {
        let state = generate_state().unwrap();
        let nonce = generate_nonce().unwrap();
        assert_ne!(state, nonce);
        assert_eq!(state.len(), 43);
        assert_eq!(nonce.len(), 43);
    }

    #[test]
    fn test_debug_redacts_verifier() {
        let pkce = PkceParams::generate().unwrap();
        let debug = format!("{:?}", pkce);
        assert!(!debug.contains(&pkce.code_verifier));
        assert!(debug.contains(&pkce.code_challenge));
    }
}
