//! HTTP implementations of the server-side verification boundaries.

pub mod http;

pub use http::{HttpPasskeyBackend, HttpSecondFactorBackend};
