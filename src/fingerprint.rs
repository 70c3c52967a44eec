//! Device fingerprint derivation and cache.
//!
//! The fingerprint is a stable, locally-persisted opaque string derived from
//! client signals. It is generated once per profile and never regenerated
//! unless the persisted copy is missing. No network calls.
//!
//! Security boundary: absence of a fingerprint is never an implicit trust
//! grant. If derivation fails, callers treat the device as untrusted.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::AuthError;
use crate::store::LocalStore;

pub const FINGERPRINT_KEY: &str = "portiere.device_fingerprint";

/// Stable client characteristics the fingerprint is derived from.
#[derive(Clone, Debug)]
pub struct DeviceSignals {
    pub platform: String,
    pub user_agent: String,
    pub language: String,
    pub timezone: String,
    pub hardware_concurrency: u32,
}

/// Source of client signals, injected so tests control derivation.
pub trait SignalSource: Send + Sync {
    fn collect(&self) -> Result<DeviceSignals, AuthError>;
}

/// Fixed signals, for tests and headless hosts.
#[derive(Clone, Debug)]
pub struct StaticSignals(pub DeviceSignals);

impl SignalSource for StaticSignals {
    fn collect(&self) -> Result<DeviceSignals, AuthError> {
        Ok(self.0.clone())
    }
}

/// Derives and persists the per-device fingerprint.
#[derive(Clone)]
pub struct FingerprintStore {
    local: Arc<dyn LocalStore>,
    signals: Arc<dyn SignalSource>,
}

impl FingerprintStore {
    #[must_use]
    pub fn new(local: Arc<dyn LocalStore>, signals: Arc<dyn SignalSource>) -> Self {
        Self { local, signals }
    }

    /// Return the cached fingerprint, deriving and persisting it on first
    /// call.
    ///
    /// # Errors
    /// Fails when signal collection or persistence fails; the caller must
    /// then treat the device as untrusted.
    pub fn get_or_create(&self) -> Result<String, AuthError> {
        if let Some(cached) = self.local.get(FINGERPRINT_KEY) {
            if !cached.is_empty() {
                return Ok(cached);
            }
        }
        let signals = self.signals.collect()?;
        let fingerprint = derive(&signals);
        self.local.put(FINGERPRINT_KEY, &fingerprint)?;
        Ok(fingerprint)
    }
}

fn derive(signals: &DeviceSignals) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signals.platform.as_bytes());
    hasher.update(b"\n");
    hasher.update(signals.user_agent.as_bytes());
    hasher.update(b"\n");
    hasher.update(signals.language.as_bytes());
    hasher.update(b"\n");
    hasher.update(signals.timezone.as_bytes());
    hasher.update(b"\n");
    hasher.update(signals.hardware_concurrency.to_le_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
