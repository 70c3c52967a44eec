//! In-memory collaborator implementations.
//!
//! Reference implementations used by the test suite and local development.
//! They honor the same contracts as real backends: the second-factor backend
//! only accepts a currently-valid session, backup codes are stored hashed
//! and consumed exactly once, and sign-out is idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Clock;
use crate::credentials::normalize_email;
use crate::error::AuthError;
use crate::second_factor::{generate_backup_code, normalize_backup_code};
use crate::store::{
    ActionLink, Authenticator, CredentialStore, DeviceTrustStore, LocalStore, PasskeyAssertion,
    PasskeyBackend, PasskeyRegistration, ProfileStore, SecondFactorBackend, SecondFactorOutcome,
    Session, SessionChange, TrustedDevice,
};

const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Generate an opaque session token. The raw value lives only in the
/// returned [`Session`].
fn generate_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")
        .map_err(AuthError::Store)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a backup code so raw codes never sit in the store.
fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
struct Account {
    user_id: Uuid,
    password: Option<SecretString>,
}

/// In-memory credential store with a broadcast session-change feed.
pub struct MemoryCredentialStore {
    clock: Arc<dyn Clock>,
    session_ttl_seconds: i64,
    accounts: Mutex<HashMap<String, Account>>,
    current: Mutex<Option<Session>>,
    honored_tokens: Mutex<HashSet<String>>,
    magic_link_requests: Mutex<Vec<String>>,
    reset_requests: Mutex<Vec<String>>,
    events: broadcast::Sender<SessionChange>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clock,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            accounts: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            honored_tokens: Mutex::new(HashSet::new()),
            magic_link_requests: Mutex::new(Vec::new()),
            reset_requests: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Seed an account directly, bypassing the signup flows.
    pub fn add_account(&self, email: &str, password: Option<SecretString>) -> Uuid {
        let user_id = Uuid::new_v4();
        lock(&self.accounts).insert(normalize_email(email), Account { user_id, password });
        user_id
    }

    /// Whether the backend would still honor this token.
    #[must_use]
    pub fn is_token_honored(&self, token: &str) -> bool {
        lock(&self.honored_tokens).contains(token)
    }

    /// Emit a token-refresh notification for the current session, if any.
    pub fn emit_refreshed(&self) {
        if let Some(session) = lock(&self.current).clone() {
            let _ = self.events.send(SessionChange::Refreshed(session));
        }
    }

    #[must_use]
    pub fn magic_link_requests(&self) -> Vec<String> {
        lock(&self.magic_link_requests).clone()
    }

    #[must_use]
    pub fn reset_requests(&self) -> Vec<String> {
        lock(&self.reset_requests).clone()
    }

    fn mint_session(&self, user_id: Uuid) -> Result<Session, AuthError> {
        let now = self.clock.now_unix();
        let session = Session {
            token: generate_token()?,
            user_id,
            issued_at_unix: now,
            expires_at_unix: now + self.session_ttl_seconds,
        };
        lock(&self.honored_tokens).insert(session.token.clone());
        *lock(&self.current) = Some(session.clone());
        let _ = self.events.send(SessionChange::SignedIn(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError> {
        let email = normalize_email(email);
        let user_id = {
            let accounts = lock(&self.accounts);
            let Some(account) = accounts.get(&email) else {
                return Err(AuthError::CredentialRejected);
            };
            let Some(stored) = &account.password else {
                return Err(AuthError::CredentialRejected);
            };
            if stored.expose_secret() != password.expose_secret() {
                return Err(AuthError::CredentialRejected);
            }
            account.user_id
        };
        self.mint_session(user_id)
    }

    async fn sign_in_with_otp(&self, email: &str) -> Result<(), AuthError> {
        // Always accepted to avoid account probing; delivery is out-of-band.
        lock(&self.magic_link_requests).push(normalize_email(email));
        Ok(())
    }

    async fn sign_up_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Session, AuthError> {
        let email = normalize_email(email);
        let user_id = Uuid::new_v4();
        {
            let mut accounts = lock(&self.accounts);
            if accounts.contains_key(&email) {
                return Err(AuthError::AlreadyRegistered);
            }
            accounts.insert(
                email,
                Account {
                    user_id,
                    password: Some(password.clone()),
                },
            );
        }
        self.mint_session(user_id)
    }

    async fn create_account(&self, email: &str) -> Result<Uuid, AuthError> {
        let email = normalize_email(email);
        let mut accounts = lock(&self.accounts);
        if accounts.contains_key(&email) {
            return Err(AuthError::AlreadyRegistered);
        }
        let user_id = Uuid::new_v4();
        accounts.insert(
            email,
            Account {
                user_id,
                password: None,
            },
        );
        Ok(user_id)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if let Some(session) = lock(&self.current).take() {
            lock(&self.honored_tokens).remove(&session.token);
        }
        let _ = self.events.send(SessionChange::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let current = lock(&self.current).clone();
        Ok(current.filter(|session| session.expires_at_unix > self.clock.now_unix()))
    }

    fn on_session_change(&self) -> broadcast::Receiver<SessionChange> {
        self.events.subscribe()
    }

    async fn update_password(&self, new_password: &SecretString) -> Result<(), AuthError> {
        let Some(session) = lock(&self.current).clone() else {
            return Err(AuthError::CredentialRejected);
        };
        let mut accounts = lock(&self.accounts);
        for account in accounts.values_mut() {
            if account.user_id == session.user_id {
                account.password = Some(new_password.clone());
                return Ok(());
            }
        }
        Err(AuthError::CredentialRejected)
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), AuthError> {
        lock(&self.reset_requests).push(normalize_email(email));
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ProfileFlags {
    onboarding_completed: bool,
    two_factor_enabled: bool,
}

/// In-memory profile/onboarding flags.
#[derive(Default)]
pub struct MemoryProfileStore {
    flags: Mutex<HashMap<Uuid, ProfileFlags>>,
}

impl MemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_onboarding_completed(&self, user_id: Uuid, completed: bool) {
        lock(&self.flags).entry(user_id).or_default().onboarding_completed = completed;
    }

    pub fn set_two_factor_enabled(&self, user_id: Uuid, enabled: bool) {
        lock(&self.flags).entry(user_id).or_default().two_factor_enabled = enabled;
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn onboarding_completed(&self, user_id: Uuid) -> Result<bool, AuthError> {
        Ok(lock(&self.flags)
            .get(&user_id)
            .copied()
            .unwrap_or_default()
            .onboarding_completed)
    }

    async fn two_factor_enabled(&self, user_id: Uuid) -> Result<bool, AuthError> {
        Ok(lock(&self.flags)
            .get(&user_id)
            .copied()
            .unwrap_or_default()
            .two_factor_enabled)
    }
}

#[derive(Debug, Default)]
struct BackupCodeSet {
    hashes: Vec<String>,
    used: HashSet<String>,
}

/// In-memory second-factor backend.
///
/// Shares the credential store so a check is only honored for a token the
/// store still considers live.
pub struct MemorySecondFactorBackend {
    credentials: Arc<MemoryCredentialStore>,
    totp_codes: Mutex<HashMap<Uuid, String>>,
    backup_codes: Mutex<HashMap<Uuid, BackupCodeSet>>,
}

impl MemorySecondFactorBackend {
    #[must_use]
    pub fn new(credentials: Arc<MemoryCredentialStore>) -> Self {
        Self {
            credentials,
            totp_codes: Mutex::new(HashMap::new()),
            backup_codes: Mutex::new(HashMap::new()),
        }
    }

    /// Set the code the server-held secret currently produces for a user.
    pub fn set_totp_code(&self, user_id: Uuid, code: &str) {
        lock(&self.totp_codes).insert(user_id, code.to_string());
    }

    /// Generate and store a fresh batch of single-use backup codes,
    /// returning the plaintext codes for display.
    pub fn issue_backup_codes(&self, user_id: Uuid, count: usize) -> Result<Vec<String>, AuthError> {
        let mut codes = Vec::with_capacity(count);
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let code = generate_backup_code()?;
            let normalized = normalize_backup_code(&code)?;
            hashes.push(hash_code(&normalized));
            codes.push(code);
        }
        lock(&self.backup_codes).insert(
            user_id,
            BackupCodeSet {
                hashes,
                used: HashSet::new(),
            },
        );
        Ok(codes)
    }

    fn require_live_session(&self, session: &Session) -> Result<(), AuthError> {
        if self.credentials.is_token_honored(&session.token) {
            Ok(())
        } else {
            Err(AuthError::CredentialRejected)
        }
    }
}

#[async_trait]
impl SecondFactorBackend for MemorySecondFactorBackend {
    async fn verify_totp(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<SecondFactorOutcome, AuthError> {
        self.require_live_session(session)?;
        let verified = lock(&self.totp_codes)
            .get(&session.user_id)
            .is_some_and(|expected| expected == code);
        Ok(SecondFactorOutcome {
            verified,
            remaining_backup_codes: None,
        })
    }

    async fn verify_backup_code(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<SecondFactorOutcome, AuthError> {
        self.require_live_session(session)?;
        let Ok(normalized) = normalize_backup_code(code) else {
            return Ok(SecondFactorOutcome {
                verified: false,
                remaining_backup_codes: None,
            });
        };
        let hash = hash_code(&normalized);

        let mut batches = lock(&self.backup_codes);
        let Some(batch) = batches.get_mut(&session.user_id) else {
            return Ok(SecondFactorOutcome {
                verified: false,
                remaining_backup_codes: None,
            });
        };

        let live = batch.hashes.contains(&hash) && !batch.used.contains(&hash);
        if !live {
            return Ok(SecondFactorOutcome {
                verified: false,
                remaining_backup_codes: None,
            });
        }
        batch.used.insert(hash);
        let remaining = batch.hashes.len().saturating_sub(batch.used.len());
        Ok(SecondFactorOutcome {
            verified: true,
            remaining_backup_codes: Some(u32::try_from(remaining).unwrap_or(u32::MAX)),
        })
    }
}

/// In-memory trusted-device records.
#[derive(Default)]
pub struct MemoryDeviceTrustStore {
    records: Mutex<HashMap<(Uuid, String), TrustedDevice>>,
}

impl MemoryDeviceTrustStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceTrustStore for MemoryDeviceTrustStore {
    async fn find(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, AuthError> {
        Ok(lock(&self.records)
            .get(&(user_id, fingerprint.to_string()))
            .cloned())
    }

    async fn upsert(&self, record: TrustedDevice) -> Result<(), AuthError> {
        lock(&self.records).insert((record.user_id, record.fingerprint.clone()), record);
        Ok(())
    }

    async fn touch(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        now_unix: i64,
    ) -> Result<(), AuthError> {
        if let Some(record) = lock(&self.records).get_mut(&(user_id, fingerprint.to_string())) {
            record.last_used_at_unix = now_unix;
        }
        Ok(())
    }

    async fn revoke(&self, user_id: Uuid, fingerprint: &str) -> Result<(), AuthError> {
        lock(&self.records).remove(&(user_id, fingerprint.to_string()));
        Ok(())
    }

    async fn list(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>, AuthError> {
        let mut devices: Vec<TrustedDevice> = lock(&self.records)
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by_key(|record| record.created_at_unix);
        Ok(devices)
    }
}

/// In-memory durable local storage.
#[derive(Default)]
pub struct MemoryLocalStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), AuthError> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        lock(&self.values).remove(key);
    }
}

/// Scripted outcome for the next authenticator prompt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthenticatorScript {
    Approve,
    /// The user dismissed the prompt.
    Cancel,
    /// No credential exists on this authenticator.
    Absent,
}

/// Scripted local authenticator.
pub struct MemoryAuthenticator {
    script: Mutex<AuthenticatorScript>,
}

impl MemoryAuthenticator {
    #[must_use]
    pub fn new(script: AuthenticatorScript) -> Self {
        Self {
            script: Mutex::new(script),
        }
    }

    pub fn set_script(&self, script: AuthenticatorScript) {
        *lock(&self.script) = script;
    }

    fn random_bytes() -> Result<Vec<u8>, AuthError> {
        let mut bytes = vec![0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate authenticator bytes")
            .map_err(AuthError::Store)?;
        Ok(bytes)
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn create_credential(&self, _email: &str) -> Result<PasskeyRegistration, AuthError> {
        match *lock(&self.script) {
            AuthenticatorScript::Approve => Ok(PasskeyRegistration {
                credential_id: Uuid::new_v4().to_string(),
                public_key: Self::random_bytes()?,
            }),
            AuthenticatorScript::Cancel => Err(AuthError::AuthenticatorCancelled),
            AuthenticatorScript::Absent => Err(AuthError::AuthenticatorAbsent),
        }
    }

    async fn get_assertion(&self, _email: &str) -> Result<PasskeyAssertion, AuthError> {
        match *lock(&self.script) {
            AuthenticatorScript::Approve => Ok(PasskeyAssertion {
                credential_id: Uuid::new_v4().to_string(),
                signature: Self::random_bytes()?,
                authenticator_data: Self::random_bytes()?,
                client_data: Self::random_bytes()?,
            }),
            AuthenticatorScript::Cancel => Err(AuthError::AuthenticatorCancelled),
            AuthenticatorScript::Absent => Err(AuthError::AuthenticatorAbsent),
        }
    }
}

/// In-memory passkey backend.
pub struct MemoryPasskeyBackend {
    registered: Mutex<HashMap<String, Uuid>>,
    fail_register: AtomicBool,
}

impl MemoryPasskeyBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(HashMap::new()),
            fail_register: AtomicBool::new(false),
        }
    }

    /// Make the next credential-persist call fail, to exercise the
    /// account-without-passkey seam.
    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn registered_user(&self, credential_id: &str) -> Option<Uuid> {
        lock(&self.registered).get(credential_id).copied()
    }
}

impl Default for MemoryPasskeyBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasskeyBackend for MemoryPasskeyBackend {
    async fn register(
        &self,
        user_id: Uuid,
        credential: &PasskeyRegistration,
    ) -> Result<(), AuthError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(AuthError::BackendUnavailable(anyhow::anyhow!(
                "credential persistence failed"
            )));
        }
        lock(&self.registered).insert(credential.credential_id.clone(), user_id);
        Ok(())
    }

    async fn authenticate(&self, assertion: &PasskeyAssertion) -> Result<ActionLink, AuthError> {
        let registered = lock(&self.registered);
        if !registered.contains_key(&assertion.credential_id) {
            return Err(AuthError::AuthenticatorAbsent);
        }
        Ok(ActionLink {
            url: format!("portiere://sign-in/{}", assertion.credential_id),
        })
    }
}
