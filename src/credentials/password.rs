//! Password credential verification, signup, and reset requests.
//!
//! Ordering is fixed: local validation, then the rate limiter, then the
//! credential store. A denied limiter check terminates the operation before
//! any network call; a successful sign-in resets the limiter so prior
//! failures stop penalizing the legitimate user.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::config::AuthConfig;
use crate::credentials::validate_email;
use crate::error::AuthError;
use crate::rate_limit::{RateLimitClass, RateLimiter};
use crate::store::{CredentialStore, Session};

#[derive(Clone)]
pub struct PasswordVerifier {
    credentials: Arc<dyn CredentialStore>,
    limiter: Arc<RateLimiter>,
    min_password_len: usize,
}

impl PasswordVerifier {
    #[must_use]
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        limiter: Arc<RateLimiter>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            credentials,
            limiter,
            min_password_len: config.min_password_len(),
        }
    }

    /// Prove identity with email and password, returning the raw session.
    ///
    /// The returned session is not yet fully authenticated; the caller must
    /// run it through the second-factor decision.
    ///
    /// # Errors
    /// `Validation` on malformed input, `RateLimited` when the attempt
    /// budget is exhausted, `CredentialRejected` from the store.
    pub async fn sign_in(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError> {
        let email = validate_email(email)?;
        self.validate_password(password)?;

        let verdict = self.limiter.check(RateLimitClass::PasswordLogin, &email);
        if !verdict.allowed {
            return Err(AuthError::RateLimited {
                resets_at_unix: verdict.resets_at_unix,
            });
        }

        let session = self
            .credentials
            .sign_in_with_password(&email, password)
            .await?;
        self.limiter.reset(RateLimitClass::PasswordLogin, &email);
        info!(user_id = %session.user_id, "password sign-in accepted");
        Ok(session)
    }

    /// Create an account with a password credential.
    ///
    /// # Errors
    /// `AlreadyRegistered` on email collision; limiter and validation errors
    /// as for [`PasswordVerifier::sign_in`].
    pub async fn sign_up(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError> {
        let email = validate_email(email)?;
        self.validate_password(password)?;

        let verdict = self.limiter.check(RateLimitClass::Signup, &email);
        if !verdict.allowed {
            return Err(AuthError::RateLimited {
                resets_at_unix: verdict.resets_at_unix,
            });
        }

        let session = self
            .credentials
            .sign_up_with_password(&email, password)
            .await?;
        self.limiter.reset(RateLimitClass::Signup, &email);
        info!(user_id = %session.user_id, "account created");
        Ok(session)
    }

    /// Request a password-reset email.
    ///
    /// The limiter is not reset on success here: a reset request succeeding
    /// says nothing about the requester's legitimacy.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let email = validate_email(email)?;
        let verdict = self.limiter.check(RateLimitClass::PasswordReset, &email);
        if !verdict.allowed {
            return Err(AuthError::RateLimited {
                resets_at_unix: verdict.resets_at_unix,
            });
        }
        self.credentials.reset_password_for_email(&email).await
    }

    /// Change the password for the currently signed-in user.
    pub async fn update_password(&self, new_password: &SecretString) -> Result<(), AuthError> {
        self.validate_password(new_password)?;
        self.credentials.update_password(new_password).await
    }

    fn validate_password(&self, password: &SecretString) -> Result<(), AuthError> {
        if password.expose_secret().len() < self.min_password_len {
            return Err(AuthError::validation(format!(
                "password must be at least {} characters",
                self.min_password_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::PasswordVerifier;
    use crate::clock::{Clock, ManualClock};
    use crate::config::AuthConfig;
    use crate::error::AuthError;
    use crate::rate_limit::RateLimiter;
    use crate::store::memory::MemoryCredentialStore;
    use crate::store::CredentialStore;
    use secrecy::SecretString;
    use std::sync::Arc;

    struct Fixture {
        clock: Arc<ManualClock>,
        credentials: Arc<MemoryCredentialStore>,
        verifier: PasswordVerifier,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = AuthConfig::new().with_login_rate_limit(5, 900);
        let credentials = Arc::new(MemoryCredentialStore::new(
            Arc::clone(&clock) as Arc<dyn crate::clock::Clock>
        ));
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&clock) as Arc<dyn crate::clock::Clock>,
            &config,
        ));
        let verifier = PasswordVerifier::new(
            Arc::clone(&credentials) as Arc<dyn CredentialStore>,
            limiter,
            &config,
        );
        Fixture {
            clock,
            credentials,
            verifier,
        }
    }

    #[tokio::test]
    async fn malformed_input_fails_before_any_attempt_is_spent() {
        let fx = fixture();
        fx.credentials
            .add_account("alice@example.com", Some(SecretString::from("hunter2boat")));

        let err = fx
            .verifier
            .sign_in("not-an-email", &SecretString::from("hunter2boat"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));

        let err = fx
            .verifier
            .sign_in("alice@example.com", &SecretString::from("short"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));

        // Validation failures consumed no limiter budget.
        for _ in 0..5 {
            let err = fx
                .verifier
                .sign_in("alice@example.com", &SecretString::from("wrong-password"))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::CredentialRejected));
        }
    }

    #[tokio::test]
    async fn sixth_failure_is_rate_limited_with_future_reset() {
        let fx = fixture();
        fx.credentials
            .add_account("alice@example.com", Some(SecretString::from("hunter2boat")));

        for _ in 0..5 {
            let _ = fx
                .verifier
                .sign_in("alice@example.com", &SecretString::from("wrong-password"))
                .await;
        }
        let err = fx
            .verifier
            .sign_in("alice@example.com", &SecretString::from("hunter2boat"))
            .await
            .unwrap_err();
        match err {
            AuthError::RateLimited { resets_at_unix } => {
                assert!(resets_at_unix > fx.clock.now_unix());
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        // After the window elapses the correct password is accepted again.
        fx.clock.advance(900);
        fx.verifier
            .sign_in("alice@example.com", &SecretString::from("hunter2boat"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let fx = fixture();
        fx.credentials
            .add_account("alice@example.com", Some(SecretString::from("hunter2boat")));

        for _ in 0..4 {
            let _ = fx
                .verifier
                .sign_in("alice@example.com", &SecretString::from("wrong-password"))
                .await;
        }
        fx.verifier
            .sign_in("alice@example.com", &SecretString::from("hunter2boat"))
            .await
            .unwrap();

        // Full budget available again after the success.
        for _ in 0..5 {
            let err = fx
                .verifier
                .sign_in("alice@example.com", &SecretString::from("wrong-password"))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::CredentialRejected));
        }
    }

    #[tokio::test]
    async fn signup_collision_and_reset_request_flow() {
        let fx = fixture();
        fx.credentials
            .add_account("alice@example.com", Some(SecretString::from("hunter2boat")));

        let err = fx
            .verifier
            .sign_up("alice@example.com", &SecretString::from("another-pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AlreadyRegistered));

        fx.verifier
            .request_password_reset("alice@example.com")
            .await
            .unwrap();
        assert_eq!(
            fx.credentials.reset_requests(),
            vec!["alice@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn reset_requests_are_throttled() {
        let fx = fixture();
        for _ in 0..3 {
            fx.verifier
                .request_password_reset("alice@example.com")
                .await
                .unwrap();
        }
        let err = fx
            .verifier
            .request_password_reset("alice@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }
}
