//! Subsystem configuration loaded at startup.

use crate::rate_limit::{RateLimitBudget, RateLimitClass};

const DEFAULT_MIN_PASSWORD_LEN: usize = 8;
const DEFAULT_TOTP_DIGITS: usize = 6;
const DEFAULT_LOGIN_ATTEMPTS: u32 = 5;
const DEFAULT_LOGIN_WINDOW_SECONDS: i64 = 15 * 60;
const DEFAULT_SIGNUP_ATTEMPTS: u32 = 3;
const DEFAULT_SIGNUP_WINDOW_SECONDS: i64 = 60 * 60;
const DEFAULT_RESET_ATTEMPTS: u32 = 3;
const DEFAULT_RESET_WINDOW_SECONDS: i64 = 60 * 60;
const DEFAULT_ONBOARDING_PATH: &str = "/onboarding";

const ENV_MIN_PASSWORD_LEN: &str = "PORTIERE_MIN_PASSWORD_LEN";
const ENV_LOGIN_ATTEMPTS: &str = "PORTIERE_LOGIN_ATTEMPTS";
const ENV_LOGIN_WINDOW_SECONDS: &str = "PORTIERE_LOGIN_WINDOW_SECONDS";
const ENV_DEVICE_TRUST_TTL_SECONDS: &str = "PORTIERE_DEVICE_TRUST_TTL_SECONDS";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    min_password_len: usize,
    totp_digits: usize,
    login_budget: RateLimitBudget,
    signup_budget: RateLimitBudget,
    reset_budget: RateLimitBudget,
    /// `None` means a trusted device stays trusted until revoked.
    device_trust_ttl_seconds: Option<i64>,
    onboarding_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
            totp_digits: DEFAULT_TOTP_DIGITS,
            login_budget: RateLimitBudget {
                attempts: DEFAULT_LOGIN_ATTEMPTS,
                window_seconds: DEFAULT_LOGIN_WINDOW_SECONDS,
            },
            signup_budget: RateLimitBudget {
                attempts: DEFAULT_SIGNUP_ATTEMPTS,
                window_seconds: DEFAULT_SIGNUP_WINDOW_SECONDS,
            },
            reset_budget: RateLimitBudget {
                attempts: DEFAULT_RESET_ATTEMPTS,
                window_seconds: DEFAULT_RESET_WINDOW_SECONDS,
            },
            device_trust_ttl_seconds: None,
            onboarding_path: DEFAULT_ONBOARDING_PATH.to_string(),
        }
    }

    /// Load overrides from `PORTIERE_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(len) = parse_usize_env(ENV_MIN_PASSWORD_LEN) {
            config.min_password_len = len;
        }
        if let Some(attempts) = parse_u32_env(ENV_LOGIN_ATTEMPTS) {
            config.login_budget.attempts = attempts;
        }
        if let Some(window) = parse_i64_env(ENV_LOGIN_WINDOW_SECONDS) {
            config.login_budget.window_seconds = window;
        }
        if let Some(ttl) = parse_i64_env(ENV_DEVICE_TRUST_TTL_SECONDS) {
            config.device_trust_ttl_seconds = Some(ttl);
        }
        config
    }

    #[must_use]
    pub fn with_min_password_len(mut self, len: usize) -> Self {
        self.min_password_len = len;
        self
    }

    #[must_use]
    pub fn with_totp_digits(mut self, digits: usize) -> Self {
        self.totp_digits = digits;
        self
    }

    #[must_use]
    pub fn with_login_rate_limit(mut self, attempts: u32, window_seconds: i64) -> Self {
        self.login_budget = RateLimitBudget {
            attempts,
            window_seconds,
        };
        self
    }

    #[must_use]
    pub fn with_signup_rate_limit(mut self, attempts: u32, window_seconds: i64) -> Self {
        self.signup_budget = RateLimitBudget {
            attempts,
            window_seconds,
        };
        self
    }

    #[must_use]
    pub fn with_reset_rate_limit(mut self, attempts: u32, window_seconds: i64) -> Self {
        self.reset_budget = RateLimitBudget {
            attempts,
            window_seconds,
        };
        self
    }

    #[must_use]
    pub fn with_device_trust_ttl_seconds(mut self, ttl_seconds: Option<i64>) -> Self {
        self.device_trust_ttl_seconds = ttl_seconds;
        self
    }

    #[must_use]
    pub fn with_onboarding_path(mut self, path: String) -> Self {
        self.onboarding_path = path;
        self
    }

    #[must_use]
    pub fn min_password_len(&self) -> usize {
        self.min_password_len
    }

    #[must_use]
    pub fn totp_digits(&self) -> usize {
        self.totp_digits
    }

    #[must_use]
    pub fn device_trust_ttl_seconds(&self) -> Option<i64> {
        self.device_trust_ttl_seconds
    }

    #[must_use]
    pub fn onboarding_path(&self) -> &str {
        &self.onboarding_path
    }

    #[must_use]
    pub fn rate_limit_budget(&self, class: RateLimitClass) -> RateLimitBudget {
        match class {
            RateLimitClass::PasswordLogin => self.login_budget,
            RateLimitClass::Signup => self.signup_budget,
            RateLimitClass::PasswordReset => self.reset_budget,
        }
    }
}

fn parse_usize_env(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_u32_env(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_i64_env(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::AuthConfig;
    use crate::rate_limit::RateLimitClass;

    #[test]
    fn defaults_and_overrides() {
        let config = AuthConfig::new();
        assert_eq!(config.min_password_len(), super::DEFAULT_MIN_PASSWORD_LEN);
        assert_eq!(config.totp_digits(), super::DEFAULT_TOTP_DIGITS);
        assert_eq!(config.device_trust_ttl_seconds(), None);
        assert_eq!(config.onboarding_path(), "/onboarding");

        let budget = config.rate_limit_budget(RateLimitClass::PasswordLogin);
        assert_eq!(budget.attempts, super::DEFAULT_LOGIN_ATTEMPTS);
        assert_eq!(budget.window_seconds, super::DEFAULT_LOGIN_WINDOW_SECONDS);

        let config = config
            .with_min_password_len(12)
            .with_login_rate_limit(3, 60)
            .with_device_trust_ttl_seconds(Some(86_400))
            .with_onboarding_path("/welcome".to_string());
        assert_eq!(config.min_password_len(), 12);
        assert_eq!(
            config.rate_limit_budget(RateLimitClass::PasswordLogin).attempts,
            3
        );
        assert_eq!(config.device_trust_ttl_seconds(), Some(86_400));
        assert_eq!(config.onboarding_path(), "/welcome");
    }

    #[test]
    fn budgets_are_per_class() {
        let config = AuthConfig::new()
            .with_signup_rate_limit(2, 10)
            .with_reset_rate_limit(7, 20);
        assert_eq!(config.rate_limit_budget(RateLimitClass::Signup).attempts, 2);
        assert_eq!(
            config.rate_limit_budget(RateLimitClass::PasswordReset).attempts,
            7
        );
    }
}
