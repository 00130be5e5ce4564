//! Proof key and `state` for the federated login redirect (RFC 7636).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Only challenge method this crate sends.
pub const CHALLENGE_METHOD: &str = "S256";

/// Verifier/challenge pair for one federated login attempt.
///
/// The challenge goes into the authorization URL; the verifier stays with
/// the caller and is sent with the callback exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct Pkce {
    verifier: String,
    challenge: String,
}

impl Pkce {
    /// Fresh pair from 48 random bytes (a 64-character verifier).
    #[must_use]
    pub fn generate() -> Self {
        Self::from_verifier(random_url_safe::<48>())
    }

    /// Rebuild the pair from a verifier kept across a redirect.
    #[must_use]
    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }

    #[must_use]
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

impl std::fmt::Debug for Pkce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkce")
            .field("verifier", &"***")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Random value tying a callback to the redirect that started it.
#[must_use]
pub fn new_state() -> String {
    random_url_safe::<16>()
}

fn random_url_safe<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_verifier_is_url_safe() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier().len(), 64);
        assert!(
            pkce.verifier()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(pkce, Pkce::generate());
    }

    #[test]
    fn challenge_matches_rfc7636_vector() {
        // RFC 7636, Appendix B.
        let pkce = Pkce::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(pkce.challenge(), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn debug_hides_verifier() {
        let pkce = Pkce::from_verifier("secret-verifier");
        assert!(!format!("{pkce:?}").contains("secret-verifier"));
    }

    #[test]
    fn state_is_unique() {
        let state = new_state();
        assert_eq!(state.len(), 22);
        assert_ne!(state, new_state());
    }
}
