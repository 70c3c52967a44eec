//! Session Guard: the route-gate state machine.
//!
//! Flow Overview:
//! 1) `Initializing`: one authoritative session check runs while a push
//!    subscription delivers identity-change notifications; the race is
//!    resolved by a "settled" flag so the one-shot check never overrides
//!    state a faster event already resolved.
//! 2) With a session, the guard blocks on the second factor until the
//!    session-scoped verified flag is present, then checks onboarding once
//!    per distinct path.
//! 3) `Active`: children render until a sign-out notification tears
//!    everything down.
//!
//! Security boundaries:
//! - A session is never fully authenticated while the second factor is
//!   enabled and neither a trust record nor the session-scoped flag vouches
//!   for this browser session.
//! - Only an explicit sign-out notification clears the session; transient
//!   notification noise (token refresh) never boots an active user.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::store::{CredentialStore, ProfileStore, Session, SessionChange};

/// Session-scoped "second factor verified" flags, keyed by user id.
///
/// Owned by the guard and passed down to the flows that satisfy the second
/// factor; scoped to this process, never persisted across restarts.
#[derive(Clone, Default)]
pub struct SessionTrust {
    verified: Arc<Mutex<HashSet<Uuid>>>,
}

impl SessionTrust {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_verified(&self, user_id: Uuid) {
        self.lock().insert(user_id);
    }

    #[must_use]
    pub fn is_verified(&self, user_id: Uuid) -> bool {
        self.lock().contains(&user_id)
    }

    pub fn clear(&self, user_id: Uuid) {
        self.lock().remove(&user_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        match self.verified.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuardState {
    Initializing,
    Unauthenticated,
    AwaitingSecondFactor,
    PendingOnboarding,
    Active,
    SignedOut,
}

/// What the host should do for a protected view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteDecision {
    Render,
    RedirectToSignIn,
    RedirectToOnboarding,
    /// Render a blocking second-factor prompt; the only escape paths are
    /// verification and explicit sign-out.
    BlockOnSecondFactor,
}

pub struct SessionGuard {
    credentials: Arc<dyn CredentialStore>,
    profiles: Arc<dyn ProfileStore>,
    session_trust: SessionTrust,
    events: broadcast::Receiver<SessionChange>,
    state: GuardState,
    session: Option<Session>,
    /// Set once either source of truth has resolved initial state.
    settled: bool,
    /// Cleared on teardown; no state write may happen afterwards.
    mounted: bool,
    onboarding_path: String,
    /// Last `(user, path)` whose onboarding flag was checked, with the
    /// outcome. Re-renders on the same path reuse it.
    onboarding_checked: Option<(Uuid, String, bool)>,
}

impl SessionGuard {
    #[must_use]
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        profiles: Arc<dyn ProfileStore>,
        session_trust: SessionTrust,
        config: &AuthConfig,
    ) -> Self {
        // Subscribe before anything else so no notification is missed
        // between construction and the authoritative check.
        let events = credentials.on_session_change();
        Self {
            credentials,
            profiles,
            session_trust,
            events,
            state: GuardState::Initializing,
            session: None,
            settled: false,
            mounted: true,
            onboarding_path: config.onboarding_path().to_string(),
            onboarding_checked: None,
        }
    }

    /// Perform the one authoritative session check.
    ///
    /// Idempotent: once state has settled (here or via a push event), later
    /// calls are no-ops and never override it.
    pub async fn initialize(&mut self) -> Result<(), AuthError> {
        self.poll_events();
        if !self.mounted || self.settled {
            return Ok(());
        }
        let session = self.credentials.get_session().await?;
        // An event may have resolved state while the check was in flight.
        self.poll_events();
        if !self.mounted || self.settled {
            return Ok(());
        }
        self.settled = true;
        match session {
            Some(session) => {
                debug!(user_id = %session.user_id, "session restored");
                self.session = Some(session);
            }
            None => self.state = GuardState::Unauthenticated,
        }
        Ok(())
    }

    /// Drain pending identity-change notifications.
    pub fn poll_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(change) => self.apply_change(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    fn apply_change(&mut self, change: SessionChange) {
        if !self.mounted {
            return;
        }
        match change {
            // Only an explicit sign-out clears the session. The verified
            // flag is not cleared here: a drained queue can replay a stale
            // sign-out from a challenge teardown after a later verification
            // already set the flag. Explicit sign-out and challenge
            // abandonment clear it themselves.
            SessionChange::SignedOut => {
                self.session = None;
                self.settled = true;
                self.onboarding_checked = None;
                self.state = GuardState::Unauthenticated;
            }
            SessionChange::SignedIn(session) | SessionChange::Refreshed(session) => {
                self.settled = true;
                self.session = Some(session);
            }
        }
    }

    /// Decide what to do for a protected view at `path`.
    ///
    /// Onboarding completion is checked once per distinct path, and not at
    /// all when already on the onboarding path.
    pub async fn decide(&mut self, path: &str) -> Result<RouteDecision, AuthError> {
        self.poll_events();
        if !self.mounted {
            return Ok(RouteDecision::RedirectToSignIn);
        }

        let Some(session) = self.session.clone() else {
            self.state = GuardState::Unauthenticated;
            return Ok(RouteDecision::RedirectToSignIn);
        };
        let user_id = session.user_id;

        if self.profiles.two_factor_enabled(user_id).await?
            && !self.session_trust.is_verified(user_id)
        {
            self.state = GuardState::AwaitingSecondFactor;
            return Ok(RouteDecision::BlockOnSecondFactor);
        }

        if path == self.onboarding_path {
            self.state = GuardState::Active;
            return Ok(RouteDecision::Render);
        }

        let completed = match &self.onboarding_checked {
            Some((cached_user, cached_path, completed))
                if *cached_user == user_id && cached_path == path =>
            {
                *completed
            }
            _ => {
                let completed = self.profiles.onboarding_completed(user_id).await?;
                self.onboarding_checked = Some((user_id, path.to_string(), completed));
                completed
            }
        };
        if !completed {
            self.state = GuardState::PendingOnboarding;
            return Ok(RouteDecision::RedirectToOnboarding);
        }

        self.state = GuardState::Active;
        Ok(RouteDecision::Render)
    }

    /// Explicit sign-out. Idempotent; always clears the session-scoped
    /// second-factor flag for the user.
    pub async fn sign_out(&mut self) -> Result<(), AuthError> {
        if let Some(session) = &self.session {
            self.session_trust.clear(session.user_id);
            info!(user_id = %session.user_id, "signing out");
        }
        self.credentials.sign_out().await?;
        if !self.mounted {
            return Ok(());
        }
        self.session = None;
        self.onboarding_checked = None;
        self.settled = true;
        self.state = GuardState::SignedOut;
        Ok(())
    }

    /// Tear down: suppress every later state write.
    pub fn unmount(&mut self) {
        self.mounted = false;
    }

    #[must_use]
    pub fn state(&self) -> GuardState {
        self.state
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled
    }
}
