//! Session identifier and verification token generation.

use base64::{engine::general_purpose, Engine as _};
use rand::Rng;

/// Length of an encoded session identifier: 32 bytes, URL-safe base64 without padding.
pub const SESSION_ID_LEN: usize = 43;

fn random_token() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a cryptographically random session identifier.
///
/// URL-safe so it can travel in a cookie without quoting.
pub fn generate_session_id() -> String {
    random_token()
}

/// Generate a single-use email verification token.
pub fn generate_verification_token() -> String {
    random_token()
}

/// Whether `candidate` has the shape of an identifier produced here.
///
/// Malformed identifiers are rejected before any store lookup.
pub fn is_well_formed(candidate: &str) -> bool {
    candidate.len() == SESSION_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_session_id() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);

        let decoded = general_purpose::URL_SAFE_NO_PAD.decode(&id).unwrap();
        assert_eq!(decoded.len(), 32);
        assert!(is_well_formed(&id));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
        assert_ne!(generate_verification_token(), generate_verification_token());
    }

    #[test]
    fn test_is_well_formed_rejects_garbage() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("short"));
        assert!(!is_well_formed(&"a".repeat(SESSION_ID_LEN + 1)));
        assert!(!is_well_formed(&format!("{}=", "a".repeat(SESSION_ID_LEN - 1))));
        assert!(is_well_formed(&"a".repeat(SESSION_ID_LEN)));
    }
}
