//! Engine configuration.
//!
//! Defaults are usable as-is; `from_env` overrides them from
//! `BRANCHLEDGER_*` variables.

use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;

pub const ENV_ACK_TIMEOUT_SECS: &str = "BRANCHLEDGER_ACK_TIMEOUT_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "BRANCHLEDGER_SWEEP_INTERVAL_SECS";
pub const ENV_DISPATCH_MAX_ATTEMPTS: &str = "BRANCHLEDGER_DISPATCH_MAX_ATTEMPTS";
pub const ENV_DISPATCH_BASE_DELAY_MS: &str = "BRANCHLEDGER_DISPATCH_BASE_DELAY_MS";
pub const ENV_DISPATCH_MAX_DELAY_MS: &str = "BRANCHLEDGER_DISPATCH_MAX_DELAY_MS";
pub const ENV_COMMIT_MAX_ATTEMPTS: &str = "BRANCHLEDGER_COMMIT_MAX_ATTEMPTS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long a batch may await acknowledgement before it is flagged.
    pub ack_timeout: Duration,
    /// Period of the reconciliation sweep.
    pub sweep_interval: Duration,
    /// Retry schedule for a single acknowledgement delivery.
    pub dispatch_retry: RetryPolicy,
    /// Attempts at committing a confirmed batch under concurrent updates.
    pub commit_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(30),
            dispatch_retry: RetryPolicy::default(),
            commit_max_attempts: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = read_positive(&lookup, ENV_ACK_TIMEOUT_SECS)? {
            config.ack_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_positive(&lookup, ENV_SWEEP_INTERVAL_SECS)? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(attempts) = read_positive(&lookup, ENV_DISPATCH_MAX_ATTEMPTS)? {
            config.dispatch_retry.max_attempts = to_u32(ENV_DISPATCH_MAX_ATTEMPTS, attempts)?;
        }
        if let Some(ms) = read_positive(&lookup, ENV_DISPATCH_BASE_DELAY_MS)? {
            config.dispatch_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = read_positive(&lookup, ENV_DISPATCH_MAX_DELAY_MS)? {
            config.dispatch_retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = read_positive(&lookup, ENV_COMMIT_MAX_ATTEMPTS)? {
            config.commit_max_attempts = to_u32(ENV_COMMIT_MAX_ATTEMPTS, attempts)?;
        }

        if config.dispatch_retry.max_delay < config.dispatch_retry.base_delay {
            return Err(ConfigError::Invalid {
                var: ENV_DISPATCH_MAX_DELAY_MS,
                value: config.dispatch_retry.max_delay.as_millis().to_string(),
                reason: "must not be below the base delay",
            });
        }
        Ok(config)
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_dispatch_retry(mut self, policy: RetryPolicy) -> Self {
        self.dispatch_retry = policy;
        self
    }

    pub fn with_commit_max_attempts(mut self, attempts: u32) -> Self {
        self.commit_max_attempts = attempts.max(1);
        self
    }

    /// Acknowledgement timeout as a calendar duration for timestamp arithmetic.
    pub fn ack_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ack_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
    }
}

fn read_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: "expected a non-negative integer",
    })?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero",
        });
    }
    Ok(Some(value))
}

fn to_u32(var: &'static str, value: u64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: "out of range",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_ACK_TIMEOUT_SECS, "60"),
            (ENV_DISPATCH_MAX_ATTEMPTS, "2"),
            (ENV_DISPATCH_BASE_DELAY_MS, "10"),
            (ENV_DISPATCH_MAX_DELAY_MS, "40"),
            (ENV_COMMIT_MAX_ATTEMPTS, "7"),
        ]))
        .unwrap();
        assert_eq!(config.ack_timeout, Duration::from_secs(60));
        assert_eq!(config.dispatch_retry.max_attempts, 2);
        assert_eq!(config.dispatch_retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.commit_max_attempts, 7);
    }

    #[test]
    fn malformed_and_zero_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_ACK_TIMEOUT_SECS, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_ACK_TIMEOUT_SECS, .. }));

        let err = EngineConfig::from_lookup(lookup(&[(ENV_COMMIT_MAX_ATTEMPTS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_COMMIT_MAX_ATTEMPTS, .. }));
    }

    #[test]
    fn max_delay_below_base_delay_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[
            (ENV_DISPATCH_BASE_DELAY_MS, "500"),
            (ENV_DISPATCH_MAX_DELAY_MS, "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_DISPATCH_MAX_DELAY_MS, .. }));
    }
}
