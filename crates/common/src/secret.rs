//! Secret types for protecting sensitive values from accidental logging.
//!
//! Meeting passwords and the token signing key travel through config,
//! store documents and request bodies. Holding them as [`SecretString`]
//! means any `Debug` derive on the containing struct prints a redaction
//! marker instead of the value.
//!
//! ```rust
//! use common::secret::{secrets_match, SecretString};
//!
//! let stored = SecretString::from("hunter2");
//! assert!(secrets_match(&stored, "hunter2"));
//! assert!(!secrets_match(&stored, "hunter3"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

use ring::hmac;
use ring::rand::SystemRandom;

/// Compare a stored secret against a caller-supplied candidate in constant time.
///
/// Both sides are MACed under a one-off random key and the tags compared with
/// `ring::hmac::verify`, so timing does not depend on the length of the common
/// prefix. Returns `false` if the system RNG is unavailable.
#[must_use]
pub fn secrets_match(stored: &SecretString, candidate: &str) -> bool {
    let rng = SystemRandom::new();
    let Ok(key) = hmac::Key::generate(hmac::HMAC_SHA256, &rng) else {
        return false;
    };
    let tag = hmac::sign(&key, stored.expose_secret().as_bytes());
    hmac::verify(&key, candidate.as_bytes(), tag.as_ref()).is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_meeting_password_is_redacted_in_documents() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct CreateMeeting {
            title: String,
            password: Option<SecretString>,
        }

        let json = r#"{"title": "standup", "password": "open-sesame"}"#;
        let body: CreateMeeting = serde_json::from_str(json).expect("deserialize");

        let debug = format!("{body:?}");
        assert!(debug.contains("standup"));
        assert!(!debug.contains("open-sesame"));
        assert_eq!(
            body.password.as_ref().map(|p| p.expose_secret().to_string()),
            Some("open-sesame".to_string())
        );
    }

    #[test]
    fn test_secrets_match() {
        let stored = SecretString::from("correct horse");
        assert!(secrets_match(&stored, "correct horse"));
        assert!(!secrets_match(&stored, "correct hors"));
        assert!(!secrets_match(&stored, "correct horse battery"));
        assert!(!secrets_match(&stored, ""));
    }
}
