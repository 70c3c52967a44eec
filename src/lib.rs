//! # Portiere (Session Establishment & Device Trust)
//!
//! `portiere` turns external identity primitives (credential store, second
//! factor, passkeys) into a single session-establishment subsystem with
//! device-trust memory and a route-gate state machine.
//!
//! ## Flow Overview
//!
//! 1. A credential verifier ([`credentials`]) proves first-factor identity
//!    against the external store, behind a fixed-window rate limiter that
//!    resets on success.
//! 2. When the account has a second factor enabled, the gate
//!    ([`second_factor`]) consults the trusted-device registry ([`trust`]),
//!    keyed by a locally derived fingerprint ([`fingerprint`]); untrusted
//!    devices get the provisional session torn down and a challenge issued.
//! 3. The session guard ([`guard`]) decides per protected path: sign-in
//!    redirect, second-factor block, onboarding redirect, or render.
//!
//! ## Security boundaries
//!
//! - No partial authentication: while a second-factor challenge is open, no
//!   observable session exists; verification re-establishes one only after
//!   the factor checks out.
//! - Device trust is written only on explicit user consent after a
//!   successful second-factor check, and fingerprint failures fail closed
//!   (the device is treated as untrusted).
//! - Only an explicit sign-out clears guard state; notification noise such
//!   as token refresh never boots an active user.

pub mod backend;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod rate_limit;
pub mod second_factor;
pub mod store;
pub mod trust;

pub use error::AuthError;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
