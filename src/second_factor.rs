//! Second-factor verification.
//!
//! Flow Overview:
//! 1) After password verification, look up a trusted device for
//!    `(user, fingerprint)`; a hit refreshes `last_used_at` and skips the
//!    challenge entirely.
//! 2) On a miss, the just-established session is invalidated before the
//!    challenge is issued, so no partially-authenticated session is ever
//!    observable.
//! 3) Verification re-establishes the session with the original credential
//!    (the backend only honors a check for a live session), then asks the
//!    backend to check a TOTP or single-use backup code.
//! 4) "Remember this device" writes a trust record only after verification
//!    succeeds.
//!
//! Security boundaries:
//! - The pending challenge holds the user id and the original credential
//!   under `secrecy`; the password is never logged or exposed.
//! - Failures return to the issued state; retries are bounded by the
//!   password limiter on the re-authentication step, not counted here.

use anyhow::Context;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::credentials::password::PasswordVerifier;
use crate::error::AuthError;
use crate::fingerprint::FingerprintStore;
use crate::guard::SessionTrust;
use crate::store::{CredentialStore, ProfileStore, SecondFactorBackend, Session};
use crate::trust::DeviceTrust;

const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP_SIZE: usize = 4;
// No 0/O or 1/I: codes are read back by humans.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecondFactorMethod {
    Totp,
    BackupCode,
}

/// Lifecycle of a challenge. Failed attempts stay in `Issued`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChallengeState {
    Issued,
    Verified,
    Abandoned,
}

/// Transient state held only for the duration of the second-factor prompt.
///
/// Destroyed on success, cancellation, or navigation away. Holds the
/// original credential because verification must re-establish the session
/// the challenge invalidated.
#[derive(Debug)]
pub struct SecondFactorChallenge {
    user_id: Uuid,
    email: String,
    password: Option<SecretString>,
    state: ChallengeState,
    method: Option<SecondFactorMethod>,
}

impl SecondFactorChallenge {
    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn state(&self) -> ChallengeState {
        self.state
    }

    /// Method used by the most recent verification attempt.
    #[must_use]
    pub fn method(&self) -> Option<SecondFactorMethod> {
        self.method
    }
}

/// Outcome of a password sign-in after the second-factor decision.
#[derive(Debug)]
pub enum SignInAdvance {
    /// No second factor required (disabled, or a trusted device).
    Complete(Session),
    /// The session was invalidated; the caller must prompt for a code.
    ChallengeRequired(SecondFactorChallenge),
}

/// A finalized, factor-verified sign-in.
#[derive(Debug)]
pub struct VerifiedSignIn {
    pub session: Session,
    /// Present after a backup-code verification.
    pub remaining_backup_codes: Option<u32>,
}

/// Drives the second-factor decision and challenge verification.
#[derive(Clone)]
pub struct SecondFactorGate {
    credentials: Arc<dyn CredentialStore>,
    profiles: Arc<dyn ProfileStore>,
    backend: Arc<dyn SecondFactorBackend>,
    password: PasswordVerifier,
    fingerprints: FingerprintStore,
    trust: DeviceTrust,
    session_trust: SessionTrust,
    totp_digits: usize,
}

impl SecondFactorGate {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        profiles: Arc<dyn ProfileStore>,
        backend: Arc<dyn SecondFactorBackend>,
        password: PasswordVerifier,
        fingerprints: FingerprintStore,
        trust: DeviceTrust,
        session_trust: SessionTrust,
        config: &AuthConfig,
    ) -> Self {
        Self {
            credentials,
            profiles,
            backend,
            password,
            fingerprints,
            trust,
            session_trust,
            totp_digits: config.totp_digits(),
        }
    }

    /// Full password sign-in: credential verification followed by the
    /// second-factor decision.
    ///
    /// # Errors
    /// Everything [`PasswordVerifier::sign_in`] returns, plus store errors
    /// from the trust lookup.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: SecretString,
    ) -> Result<SignInAdvance, AuthError> {
        let session = self.password.sign_in(email, &password).await?;
        self.after_password(session, email, password).await
    }

    /// The second-factor decision for a freshly password-verified session.
    async fn after_password(
        &self,
        session: Session,
        email: &str,
        password: SecretString,
    ) -> Result<SignInAdvance, AuthError> {
        let user_id = session.user_id;
        if !self.profiles.two_factor_enabled(user_id).await? {
            self.session_trust.mark_verified(user_id);
            return Ok(SignInAdvance::Complete(session));
        }

        // Fail closed: no fingerprint means no trust grant.
        let trusted = match self.fingerprints.get_or_create() {
            Ok(fingerprint) => self.trust.recognize(user_id, &fingerprint).await?,
            Err(err) => {
                warn!("fingerprint unavailable, treating device as untrusted: {err}");
                false
            }
        };
        if trusted {
            info!(user_id = %user_id, "second factor skipped for trusted device");
            self.session_trust.mark_verified(user_id);
            return Ok(SignInAdvance::Complete(session));
        }

        // No partially-authenticated session may be observable while the
        // challenge is open.
        self.credentials.sign_out().await?;
        Ok(SignInAdvance::ChallengeRequired(SecondFactorChallenge {
            user_id,
            email: email.trim().to_lowercase(),
            password: Some(password),
            state: ChallengeState::Issued,
            method: None,
        }))
    }

    /// Verify a TOTP or backup code against an open challenge.
    ///
    /// On success the session is re-established and, when `remember_label`
    /// is given, the device is recorded as trusted. On a wrong code the
    /// session is dropped again and the challenge stays open.
    ///
    /// # Errors
    /// `SecondFactorRejected` (retryable), `RateLimited` from the
    /// re-authentication step, backend and store failures.
    pub async fn verify(
        &self,
        challenge: &mut SecondFactorChallenge,
        method: SecondFactorMethod,
        code: &str,
        remember_label: Option<&str>,
    ) -> Result<VerifiedSignIn, AuthError> {
        if challenge.state != ChallengeState::Issued {
            return Err(AuthError::validation("challenge is not open"));
        }
        let code = self.validate_code(method, code)?;
        challenge.method = Some(method);

        let session = self.reestablish_session(challenge).await?;

        let outcome = match method {
            SecondFactorMethod::Totp => self.backend.verify_totp(&session, &code).await,
            SecondFactorMethod::BackupCode => {
                self.backend.verify_backup_code(&session, &code).await
            }
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.credentials.sign_out().await?;
                return Err(err);
            }
        };

        if !outcome.verified {
            self.credentials.sign_out().await?;
            warn!(user_id = %challenge.user_id, "second-factor code rejected");
            return Err(AuthError::SecondFactorRejected);
        }

        if let Some(label) = remember_label {
            // Trust is written only after verification succeeded.
            match self.fingerprints.get_or_create() {
                Ok(fingerprint) => {
                    self.trust
                        .remember(challenge.user_id, &fingerprint, label)
                        .await?;
                }
                Err(err) => {
                    warn!("device not remembered, fingerprint unavailable: {err}");
                }
            }
        }

        challenge.state = ChallengeState::Verified;
        challenge.password = None;
        self.session_trust.mark_verified(challenge.user_id);
        info!(user_id = %challenge.user_id, "second factor verified");
        Ok(VerifiedSignIn {
            session,
            remaining_backup_codes: outcome.remaining_backup_codes,
        })
    }

    /// Cancel an open challenge: drop the credential, clear the
    /// session-scoped flag, and sign out so a re-login starts clean.
    pub async fn abandon(&self, challenge: &mut SecondFactorChallenge) -> Result<(), AuthError> {
        challenge.state = ChallengeState::Abandoned;
        challenge.password = None;
        self.session_trust.clear(challenge.user_id);
        self.credentials.sign_out().await
    }

    /// The backend only honors a check for a currently-valid session, and
    /// the challenge invalidated the one the password established.
    async fn reestablish_session(
        &self,
        challenge: &SecondFactorChallenge,
    ) -> Result<Session, AuthError> {
        if let Some(session) = self.credentials.get_session().await? {
            if session.user_id == challenge.user_id {
                return Ok(session);
            }
        }
        let Some(password) = &challenge.password else {
            return Err(AuthError::CredentialRejected);
        };
        self.password.sign_in(&challenge.email, password).await
    }

    fn validate_code(
        &self,
        method: SecondFactorMethod,
        code: &str,
    ) -> Result<String, AuthError> {
        match method {
            SecondFactorMethod::Totp => {
                let trimmed = code.trim();
                if trimmed.len() != self.totp_digits
                    || !trimmed.bytes().all(|byte| byte.is_ascii_digit())
                {
                    return Err(AuthError::validation(format!(
                        "code must be {} digits",
                        self.totp_digits
                    )));
                }
                Ok(trimmed.to_string())
            }
            SecondFactorMethod::BackupCode => normalize_backup_code(code),
        }
    }
}

/// Normalize a backup code for verification (case and dash tolerant).
pub fn normalize_backup_code(input: &str) -> Result<String, AuthError> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != BACKUP_CODE_LEN {
        return Err(AuthError::validation("invalid backup code length"));
    }
    if !normalized
        .as_bytes()
        .iter()
        .all(|ch| BACKUP_CODE_ALPHABET.contains(ch))
    {
        return Err(AuthError::validation("invalid backup code characters"));
    }
    Ok(normalized)
}

/// Format a normalized backup code for display.
pub fn format_backup_code(normalized: &str) -> Result<String, AuthError> {
    if normalized.len() != BACKUP_CODE_LEN {
        return Err(AuthError::validation("invalid backup code length"));
    }
    let mut out = String::with_capacity(BACKUP_CODE_LEN + 2);
    for (idx, chunk) in normalized.as_bytes().chunks(BACKUP_CODE_GROUP_SIZE).enumerate() {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(
            std::str::from_utf8(chunk)
                .context("invalid backup code chunk")
                .map_err(AuthError::Store)?,
        );
    }
    Ok(out)
}

/// Generate a single backup code in grouped display form.
pub(crate) fn generate_backup_code() -> Result<String, AuthError> {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    OsRng
        .try_fill_bytes(&mut raw)
        .context("failed to generate backup code")
        .map_err(AuthError::Store)?;
    let mut normalized = String::with_capacity(BACKUP_CODE_LEN);
    for byte in raw {
        let idx = usize::from(byte) % BACKUP_CODE_ALPHABET.len();
        if let Some(&char_byte) = BACKUP_CODE_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format_backup_code(&normalized)
}
