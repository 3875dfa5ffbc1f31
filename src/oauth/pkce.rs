//! PKCE S256 challenge and state generation (RFC 7636).
//!
//! The verifier is 64 cryptographically random bytes, base64url-encoded
//! without padding (86 characters, within the 43..=128 range RFC 7636
//! allows). The challenge is `BASE64URL(SHA-256(verifier))` with
//! `code_challenge_method=S256`. The `state` correlation value is a separate
//! 128-bit random string.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore as _;
use sha2::{Digest, Sha256};

/// A PKCE verifier/challenge pair.
///
/// The verifier is single-use: it is stored in the pending record when the
/// authorization URL is issued, consumed on callback, and sent to the token
/// endpoint exactly once.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Base64url-encoded (no padding) random verifier, 86 characters.
    pub verifier: String,
    /// Base64url-encoded (no padding) SHA-256 digest of the verifier.
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a fresh verifier and its S256 challenge.
    pub fn generate() -> Self {
        let mut random_bytes = [0u8; 64];
        rand::rng().fill_bytes(&mut random_bytes);

        let verifier = URL_SAFE_NO_PAD.encode(random_bytes);
        let challenge = challenge_for(&verifier);

        Self {
            verifier,
            challenge,
        }
    }

    /// The challenge method. Always `"S256"`.
    pub fn method(&self) -> &'static str {
        "S256"
    }
}

/// Compute the S256 challenge for a verifier:
/// `BASE64URL(SHA256(ASCII(code_verifier)))` per RFC 7636 Section 4.2.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Generate a cryptographically random opaque `state` value: 128 bits,
/// base64url-encoded without padding.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_is_86_base64url_chars() {
        let pkce = PkceChallenge::generate();
        // 64 bytes * 4/3 without padding.
        assert_eq!(pkce.verifier.len(), 86);
        assert!(
            pkce.verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "verifier must be base64url without padding: {}",
            pkce.verifier
        );
    }

    #[test]
    fn test_challenge_is_s256_of_verifier() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.challenge, challenge_for(&pkce.verifier));
        assert_ne!(pkce.challenge, pkce.verifier);
        assert_eq!(pkce.method(), "S256");
    }

    #[test]
    fn test_successive_pairs_are_distinct() {
        let a = PkceChallenge::generate();
        let b = PkceChallenge::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn test_state_is_128_bits_of_entropy() {
        let state = generate_state();
        // 16 bytes * 4/3 without padding.
        assert_eq!(state.len(), 22);
        assert_ne!(generate_state(), state);
    }

    /// RFC 7636 Appendix B known-answer vector.
    #[test]
    fn test_s256_known_answer() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }
}
