//! PKCE (RFC 7636) verification. Only `S256` is accepted.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use super::OAuthError;

/// The only challenge method the gateway accepts.
pub const S256: &str = "S256";

const VERIFIER_MIN_LEN: usize = 43;
const VERIFIER_MAX_LEN: usize = 128;

/// Check the verifier shape: 43–128 chars of `[A-Za-z0-9._~-]` (RFC 7636 §4.1).
pub fn validate_code_verifier(verifier: &str) -> Result<(), OAuthError> {
    let len = verifier.len();
    if !(VERIFIER_MIN_LEN..=VERIFIER_MAX_LEN).contains(&len) {
        return Err(OAuthError::InvalidRequest(format!(
            "code_verifier must be {VERIFIER_MIN_LEN}-{VERIFIER_MAX_LEN} characters"
        )));
    }
    let valid = verifier
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));
    if !valid {
        return Err(OAuthError::InvalidRequest(
            "code_verifier contains invalid characters".into(),
        ));
    }
    Ok(())
}

/// Reject any challenge method but `S256`; `plain` is never accepted.
pub fn validate_challenge_method(method: &str) -> Result<(), OAuthError> {
    if method == S256 {
        Ok(())
    } else {
        Err(OAuthError::InvalidRequest(format!(
            "code_challenge_method must be {S256}"
        )))
    }
}

/// Compute S256 code challenge from a code verifier.
pub fn compute_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Verify `verifier` against the challenge bound into the authorization code.
pub fn verify_pkce(verifier: &str, challenge: &str, method: &str) -> Result<(), OAuthError> {
    let computed = compute_code_challenge(verifier);
    if method != S256 || !constant_time_eq(computed.as_bytes(), challenge.as_bytes()) {
        return Err(OAuthError::InvalidGrant("PKCE verification failed".into()));
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn code_challenge_is_s256_of_verifier() {
        // RFC 7636 Appendix B test vector
        assert_eq!(compute_code_challenge(RFC_VERIFIER), RFC_CHALLENGE);
    }

    #[test]
    fn verifier_length_bounds() {
        assert!(validate_code_verifier(&"a".repeat(42)).is_err());
        assert!(validate_code_verifier(&"a".repeat(43)).is_ok());
        assert!(validate_code_verifier(&"a".repeat(128)).is_ok());
        assert!(matches!(
            validate_code_verifier(&"a".repeat(129)),
            Err(OAuthError::InvalidRequest(_))
        ));
    }

    #[test]
    fn verifier_charset() {
        let ok = format!("{}-._~", "A1".repeat(20));
        assert!(validate_code_verifier(&ok).is_ok());
        let bad = format!("{}+", "a".repeat(50));
        assert!(matches!(
            validate_code_verifier(&bad),
            Err(OAuthError::InvalidRequest(_))
        ));
        let spaced = format!("{} ", "a".repeat(50));
        assert!(validate_code_verifier(&spaced).is_err());
    }

    #[test]
    fn plain_method_is_rejected() {
        assert!(validate_challenge_method("S256").is_ok());
        assert!(validate_challenge_method("plain").is_err());
        assert!(verify_pkce(RFC_VERIFIER, RFC_VERIFIER, "plain").is_err());
    }

    #[test]
    fn mismatched_verifier_is_invalid_grant() {
        assert!(verify_pkce(RFC_VERIFIER, RFC_CHALLENGE, S256).is_ok());
        let other = "x".repeat(64);
        assert!(matches!(
            verify_pkce(&other, RFC_CHALLENGE, S256),
            Err(OAuthError::InvalidGrant(_))
        ));
    }

    proptest! {
        #[test]
        fn well_formed_verifiers_round_trip(verifier in "[A-Za-z0-9._~-]{43,128}") {
            prop_assert!(validate_code_verifier(&verifier).is_ok());
            let challenge = compute_code_challenge(&verifier);
            prop_assert_eq!(challenge.len(), 43);
            prop_assert!(verify_pkce(&verifier, &challenge, S256).is_ok());
        }

        #[test]
        fn short_verifiers_are_rejected(verifier in "[A-Za-z0-9]{0,42}") {
            prop_assert!(validate_code_verifier(&verifier).is_err());
        }
    }
}
