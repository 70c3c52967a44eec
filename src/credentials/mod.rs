//! Credential verifiers.
//!
//! Three mutually exclusive strategies, selected by the user before
//! submission: password, magic link, passkey. Each converges on the same
//! outcome: an identity session handed to the second-factor decision.
//!
//! Validation that the client can perform (email format, password length,
//! code shape) happens before any network round-trip so bad input never
//! spends rate-limit budget.

pub mod magic_link;
pub mod passkey;
pub mod password;

use regex::Regex;

use crate::error::AuthError;

/// Normalize an email for lookup and limiter keying.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Normalize and validate an email, failing fast on malformed input.
pub(crate) fn validate_email(email: &str) -> Result<String, AuthError> {
    let normalized = normalize_email(email);
    if valid_email(&normalized) {
        Ok(normalized)
    } else {
        Err(AuthError::validation("malformed email address"))
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_email, valid_email, validate_email};

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("name.surname@example.co"));
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-at.example.com"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn validate_email_normalizes() {
        assert_eq!(
            validate_email(" Bob@Example.com ").ok().as_deref(),
            Some("bob@example.com")
        );
        assert!(validate_email("nope").is_err());
    }
}
