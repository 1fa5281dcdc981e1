//! Engine configuration from the environment.

use std::str::FromStr;
use std::time::Duration;

use steward_core::ClaimMode;
use tracing::warn;

use crate::retry::RetryConfig;
use crate::wait::WaitOptions;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergeConfig {
    pub claim_mode: ClaimMode,
    pub retry: RetryConfig,
    /// Upper bound on a single converge or release call, retries included.
    pub deadline: Duration,
    pub wait: WaitOptions,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            claim_mode: ClaimMode::default(),
            retry: RetryConfig::default(),
            deadline: Duration::from_secs(30),
            wait: WaitOptions::default(),
        }
    }
}

impl ConvergeConfig {
    /// Defaults overridden by `STEWARD_*` variables. Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            claim_mode: env_or("STEWARD_CLAIM_MODE", defaults.claim_mode),
            retry: RetryConfig {
                max_attempts: env_or("STEWARD_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                initial_delay: Duration::from_millis(env_or(
                    "STEWARD_RETRY_INITIAL_MS",
                    defaults.retry.initial_delay.as_millis() as u64,
                )),
                max_delay: Duration::from_millis(env_or(
                    "STEWARD_RETRY_MAX_MS",
                    defaults.retry.max_delay.as_millis() as u64,
                )),
                ..defaults.retry
            },
            deadline: Duration::from_secs(env_or("STEWARD_CONVERGE_DEADLINE_SECS", defaults.deadline.as_secs())),
            wait: WaitOptions {
                timeout: Duration::from_secs(env_or("STEWARD_WAIT_TIMEOUT_SECS", defaults.wait.timeout.as_secs())),
                soft_timeout: defaults
                    .wait
                    .soft_timeout
                    .map(|soft| Duration::from_secs(env_or("STEWARD_WAIT_SOFT_SECS", soft.as_secs()))),
            },
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ConvergeConfig::default();
        assert_eq!(cfg.claim_mode, ClaimMode::Shared);
        assert_eq!(cfg.retry.max_attempts, 8);
        assert_eq!(cfg.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(cfg.retry.max_delay, Duration::from_millis(5000));
        assert_eq!(cfg.deadline, Duration::from_secs(30));
        assert_eq!(cfg.wait.timeout, Duration::from_secs(300));
        assert_eq!(cfg.wait.soft_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn unparsable_values_fall_back() {
        assert_eq!(parse_or("K", "12", 3u32), 12);
        assert_eq!(parse_or("K", " 12 ", 3u32), 12);
        assert_eq!(parse_or("K", "twelve", 3u32), 3);
        assert_eq!(parse_or("K", "Exclusive", ClaimMode::Shared), ClaimMode::Exclusive);
        assert_eq!(parse_or("K", "both", ClaimMode::Shared), ClaimMode::Shared);
    }
}
