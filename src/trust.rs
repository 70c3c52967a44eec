//! Trusted Device Registry.
//!
//! Maps `(user, fingerprint)` to a trust record consulted to skip the
//! second factor. Records are created only by explicit user consent after a
//! successful second-factor check, and removed only by explicit revocation
//! (or, when a trust TTL is configured, on expiry).

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AuthError;
use crate::store::{DeviceTrustStore, TrustedDevice};

#[derive(Clone)]
pub struct DeviceTrust {
    store: Arc<dyn DeviceTrustStore>,
    clock: Arc<dyn Clock>,
    /// `None`: trust never expires (explicit revocation only).
    ttl_seconds: Option<i64>,
}

impl DeviceTrust {
    #[must_use]
    pub fn new(
        store: Arc<dyn DeviceTrustStore>,
        clock: Arc<dyn Clock>,
        ttl_seconds: Option<i64>,
    ) -> Self {
        Self {
            store,
            clock,
            ttl_seconds,
        }
    }

    /// Check whether the device is trusted for the user, refreshing
    /// `last_used_at` when it is.
    ///
    /// An expired record is revoked on sight and reported as untrusted.
    pub async fn recognize(&self, user_id: Uuid, fingerprint: &str) -> Result<bool, AuthError> {
        let Some(record) = self.store.find(user_id, fingerprint).await? else {
            return Ok(false);
        };

        let now = self.clock.now_unix();
        if let Some(ttl) = self.ttl_seconds {
            if now >= record.created_at_unix + ttl {
                warn!(user_id = %user_id, "trusted-device record expired, revoking");
                self.store.revoke(user_id, fingerprint).await?;
                return Ok(false);
            }
        }

        self.store.touch(user_id, fingerprint, now).await?;
        Ok(true)
    }

    /// Record explicit consent to waive the second factor on this device.
    pub async fn remember(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        label: &str,
    ) -> Result<(), AuthError> {
        let now = self.clock.now_unix();
        self.store
            .upsert(TrustedDevice {
                user_id,
                fingerprint: fingerprint.to_string(),
                label: label.to_string(),
                created_at_unix: now,
                last_used_at_unix: now,
            })
            .await?;
        info!(user_id = %user_id, "device remembered");
        Ok(())
    }

    pub async fn revoke(&self, user_id: Uuid, fingerprint: &str) -> Result<(), AuthError> {
        self.store.revoke(user_id, fingerprint).await
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>, AuthError> {
        self.store.list(user_id).await
    }
}
