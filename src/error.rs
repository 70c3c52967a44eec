//! Error taxonomy for session establishment.
//!
//! Two families: errors resolved entirely client-side (`Validation`,
//! `RateLimited`) and errors that required at least one round-trip to a
//! collaborator. Nothing in this crate is auto-retried; every retry is
//! user-initiated.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed input caught before any network call.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Attempt denied by the rate limiter; retry after `resets_at_unix`.
    #[error("rate limited, retry after {resets_at_unix}")]
    RateLimited { resets_at_unix: i64 },

    /// The credential store refused the credential (wrong password,
    /// expired link, unknown account).
    #[error("credential rejected")]
    CredentialRejected,

    /// Wrong TOTP or backup code. Retryable; the retry budget is bounded
    /// by the password limiter on the re-authentication step.
    #[error("second-factor code rejected")]
    SecondFactorRejected,

    /// The user dismissed the authenticator prompt. Distinct from
    /// [`AuthError::AuthenticatorAbsent`]: a dismissed prompt must never be
    /// answered with a redirect to registration.
    #[error("authenticator prompt was cancelled")]
    AuthenticatorCancelled,

    /// No passkey is registered for this account.
    #[error("no passkey registered for this account")]
    AuthenticatorAbsent,

    /// Email collision during signup. Callers redirect to conventional
    /// sign-in instead of retrying the passkey flow.
    #[error("account already registered")]
    AlreadyRegistered,

    /// The account was created but the passkey credential was not saved.
    /// There is no rollback; the account stays recoverable and the user
    /// must finish via conventional sign-in.
    #[error("account {user_id} created without a usable passkey")]
    PasskeyIncomplete { user_id: Uuid },

    /// Network or endpoint failure talking to a backend.
    #[error("backend unavailable")]
    BackendUnavailable(#[source] anyhow::Error),

    /// Local or delegated persistence failure.
    #[error("storage failure")]
    Store(#[source] anyhow::Error),
}

impl AuthError {
    /// True when the error never left the client.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::RateLimited { .. })
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;

    #[test]
    fn local_errors_are_classified() {
        assert!(AuthError::validation("bad email").is_local());
        assert!(AuthError::RateLimited { resets_at_unix: 0 }.is_local());
        assert!(!AuthError::CredentialRejected.is_local());
        assert!(!AuthError::AuthenticatorCancelled.is_local());
    }

    #[test]
    fn cancellation_and_absence_are_distinct() {
        let cancelled = AuthError::AuthenticatorCancelled.to_string();
        let absent = AuthError::AuthenticatorAbsent.to_string();
        assert_ne!(cancelled, absent);
    }
}
