//! Passwordless sign-in via a one-time link delivered out-of-band.
//!
//! This path issues no local session synchronously. It succeeds when the
//! external link is later followed, which re-enters the session guard as a
//! fresh sign-in notification.

use std::sync::Arc;

use tracing::info;

use crate::credentials::validate_email;
use crate::error::AuthError;
use crate::store::CredentialStore;

#[derive(Clone)]
pub struct MagicLinkVerifier {
    credentials: Arc<dyn CredentialStore>,
}

impl MagicLinkVerifier {
    #[must_use]
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Request a one-time sign-in link for the address.
    ///
    /// # Errors
    /// `Validation` on a malformed email; store errors otherwise.
    pub async fn request(&self, email: &str) -> Result<(), AuthError> {
        let email = validate_email(email)?;
        self.credentials.sign_in_with_otp(&email).await?;
        info!("magic link requested");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::MagicLinkVerifier;
    use crate::clock::ManualClock;
    use crate::error::AuthError;
    use crate::store::memory::MemoryCredentialStore;
    use crate::store::CredentialStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn request_validates_then_delegates() {
        let credentials = Arc::new(MemoryCredentialStore::new(Arc::new(ManualClock::new(0))));
        let verifier = MagicLinkVerifier::new(Arc::clone(&credentials) as Arc<dyn CredentialStore>);

        let err = verifier.request("nope").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        assert!(credentials.magic_link_requests().is_empty());

        verifier.request(" Alice@Example.com ").await.unwrap();
        assert_eq!(
            credentials.magic_link_requests(),
            vec!["alice@example.com".to_string()]
        );
        // No local session was issued.
        assert!(credentials.get_session().await.unwrap().is_none());
    }
}
