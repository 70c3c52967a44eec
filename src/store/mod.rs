//! External collaborator boundaries.
//!
//! The subsystem is a consumer of these contracts; it defines no wire format
//! of its own. Every boundary is a trait held behind `Arc` so hosts wire
//! real backends and tests wire the [`memory`] implementations.

pub mod memory;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::AuthError;

/// An identity session owned by the external credential store.
///
/// The subsystem only reads its presence and the embedded user id; token
/// issuance and expiry are the store's business.
#[derive(Clone, Debug)]
pub struct Session {
    pub token: String,
    pub user_id: Uuid,
    pub issued_at_unix: i64,
    pub expires_at_unix: i64,
}

/// Push-style identity-change notification.
///
/// Only [`SessionChange::SignedOut`] may clear guard state; every other
/// variant updates session data without clearing it.
#[derive(Clone, Debug)]
pub enum SessionChange {
    SignedIn(Session),
    /// Token refresh or metadata update. Never treated as a sign-out.
    Refreshed(Session),
    SignedOut,
}

/// A device for which the second factor has been explicitly waived.
///
/// Unique per `(user_id, fingerprint)`. `last_used_at_unix` is refreshed on
/// every recognized login and is the record's only mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedDevice {
    pub user_id: Uuid,
    pub fingerprint: String,
    pub label: String,
    pub created_at_unix: i64,
    pub last_used_at_unix: i64,
}

/// Result of a second-factor check at the backend.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct SecondFactorOutcome {
    pub verified: bool,
    /// Present after a backup-code check; strictly decreases by one per
    /// successful use.
    pub remaining_backup_codes: Option<u32>,
}

/// Public-key credential produced by the local authenticator during
/// registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PasskeyRegistration {
    pub credential_id: String,
    pub public_key: Vec<u8>,
}

/// Signed assertion produced by the local authenticator during
/// authentication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PasskeyAssertion {
    pub credential_id: String,
    pub signature: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub client_data: Vec<u8>,
}

/// One-time action reference that completes a passkey sign-in when followed.
#[derive(Clone, Debug, Deserialize)]
pub struct ActionLink {
    pub url: String,
}

/// The external credential store (session issuance and teardown).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError>;

    /// Request a one-time sign-in link delivered out-of-band. No local
    /// session is issued synchronously.
    async fn sign_in_with_otp(&self, email: &str) -> Result<(), AuthError>;

    async fn sign_up_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError>;

    /// Create an account without a password credential (passkey signup).
    async fn create_account(&self, email: &str) -> Result<Uuid, AuthError>;

    /// Idempotent; succeeds when no session exists.
    async fn sign_out(&self) -> Result<(), AuthError>;

    async fn get_session(&self) -> Result<Option<Session>, AuthError>;

    /// Subscribe to asynchronous identity-change notifications.
    fn on_session_change(&self) -> broadcast::Receiver<SessionChange>;

    async fn update_password(&self, new_password: &SecretString) -> Result<(), AuthError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), AuthError>;
}

/// Profile and onboarding flags, read by user id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn onboarding_completed(&self, user_id: Uuid) -> Result<bool, AuthError>;
    async fn two_factor_enabled(&self, user_id: Uuid) -> Result<bool, AuthError>;
}

/// Server-side second-factor verification.
///
/// The backend only honors a check for a currently-valid session; the shared
/// secret is never materialized on this side.
#[async_trait]
pub trait SecondFactorBackend: Send + Sync {
    async fn verify_totp(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<SecondFactorOutcome, AuthError>;

    async fn verify_backup_code(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<SecondFactorOutcome, AuthError>;
}

/// Server-side passkey verification and credential persistence.
#[async_trait]
pub trait PasskeyBackend: Send + Sync {
    async fn register(
        &self,
        user_id: Uuid,
        credential: &PasskeyRegistration,
    ) -> Result<(), AuthError>;

    async fn authenticate(&self, assertion: &PasskeyAssertion) -> Result<ActionLink, AuthError>;
}

/// The local platform authenticator (biometric/PIN gated).
///
/// Implementations must distinguish a user-dismissed prompt
/// ([`AuthError::AuthenticatorCancelled`]) from a missing credential
/// ([`AuthError::AuthenticatorAbsent`]).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn create_credential(&self, email: &str) -> Result<PasskeyRegistration, AuthError>;
    async fn get_assertion(&self, email: &str) -> Result<PasskeyAssertion, AuthError>;
}

/// Persistence for trusted-device records.
#[async_trait]
pub trait DeviceTrustStore: Send + Sync {
    async fn find(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, AuthError>;

    async fn upsert(&self, record: TrustedDevice) -> Result<(), AuthError>;

    /// Refresh `last_used_at_unix` for an existing record.
    async fn touch(&self, user_id: Uuid, fingerprint: &str, now_unix: i64)
        -> Result<(), AuthError>;

    async fn revoke(&self, user_id: Uuid, fingerprint: &str) -> Result<(), AuthError>;

    async fn list(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>, AuthError>;
}

/// Durable key-value storage local to the device (fingerprint cache).
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<(), AuthError>;
    fn remove(&self, key: &str);
}
