//! Injected time source.
//!
//! Every component that reasons about windows or expiry takes an
//! `Arc<dyn Clock>` so tests can construct isolated instances and control
//! time instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current time as unix seconds.
    fn now_unix(&self) -> i64;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Fixed clock advanced explicitly. Used by the test suite.
#[derive(Debug)]
pub struct ManualClock {
    now_unix: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_unix: i64) -> Self {
        Self {
            now_unix: AtomicI64::new(start_unix),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.now_unix.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, now_unix: i64) {
        self.now_unix.store(now_unix, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.now_unix.load(Ordering::SeqCst)
    }
}
