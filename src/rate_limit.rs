//! Keyed fixed-window attempt counters for brute-force-prone operations.
//!
//! Policy: a fixed window with a hard ceiling and a reset-on-success escape
//! hatch. No sliding window, no leaky bucket. A correct credential calls
//! [`RateLimiter::reset`] so legitimate users are not penalized for prior
//! bad attempts. Counters are process-local; cross-tab or cross-process
//! consistency is not provided.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::clock::Clock;
use crate::config::AuthConfig;

/// Operation classes with independent counters and thresholds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RateLimitClass {
    PasswordLogin,
    Signup,
    PasswordReset,
}

impl RateLimitClass {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::PasswordLogin => "login",
            Self::Signup => "signup",
            Self::PasswordReset => "reset",
        }
    }
}

/// Attempt ceiling and window for one class.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitBudget {
    pub attempts: u32,
    pub window_seconds: i64,
}

/// Outcome of a single [`RateLimiter::check`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RateLimitVerdict {
    pub allowed: bool,
    /// When the current window ends and attempts are accepted again.
    pub resets_at_unix: i64,
}

#[derive(Debug)]
struct Counter {
    count: u32,
    window_start_unix: i64,
    expires_at_unix: i64,
}

/// Explicitly-owned attempt-counter store, keyed by
/// `(operation class, identity hint)`.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    budgets: HashMap<RateLimitClass, RateLimitBudget>,
    counters: Mutex<HashMap<String, Counter>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: &AuthConfig) -> Self {
        let budgets = [
            RateLimitClass::PasswordLogin,
            RateLimitClass::Signup,
            RateLimitClass::PasswordReset,
        ]
        .into_iter()
        .map(|class| (class, config.rate_limit_budget(class)))
        .collect();

        Self {
            clock,
            budgets,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt and report whether it is allowed.
    ///
    /// The counter increments on every call; the verdict reflects the
    /// pre-increment count, so the N-th failure within a window is the last
    /// one accepted when the ceiling is N.
    pub fn check(&self, class: RateLimitClass, hint: &str) -> RateLimitVerdict {
        let budget = self.budget(class);
        let now = self.clock.now_unix();
        let key = counter_key(class, hint);

        let mut counters = match self.counters.lock() {
            Ok(counters) => counters,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.retain(|_, counter| counter.expires_at_unix > now);

        let counter = counters.entry(key).or_insert_with(|| Counter {
            count: 0,
            window_start_unix: now,
            expires_at_unix: now + budget.window_seconds,
        });

        let allowed = counter.count < budget.attempts;
        counter.count += 1;
        if !allowed {
            warn!(
                class = class.as_str(),
                "attempt denied by rate limiter until {}", counter.expires_at_unix
            );
        }

        RateLimitVerdict {
            allowed,
            resets_at_unix: counter.window_start_unix + budget.window_seconds,
        }
    }

    /// Zero the counter for a key after the corresponding operation succeeds.
    pub fn reset(&self, class: RateLimitClass, hint: &str) {
        let mut counters = match self.counters.lock() {
            Ok(counters) => counters,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.remove(&counter_key(class, hint));
    }

    fn budget(&self, class: RateLimitClass) -> RateLimitBudget {
        self.budgets.get(&class).copied().unwrap_or(RateLimitBudget {
            attempts: 0,
            window_seconds: 0,
        })
    }
}

fn counter_key(class: RateLimitClass, hint: &str) -> String {
    format!("{}:{}", class.as_str(), hint)
}
