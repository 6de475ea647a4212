//! Maintenance configuration.
//!
//! Every setting has a default and can be overridden through an
//! environment variable holding an integer.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Poll interval between rounds, in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "SHARDWARDEN_MAINTENANCE_POLL_INTERVAL_MS";
/// Number of worker tasks executing actions.
pub const ENV_WORKER_THREADS: &str = "SHARDWARDEN_MAINTENANCE_WORKER_THREADS";
/// How long a fatal error keeps a resource out of the diff, in seconds.
pub const ENV_ERROR_COOLDOWN_SECS: &str = "SHARDWARDEN_MAINTENANCE_ERROR_COOLDOWN_SECS";
/// Retries granted to an action failing with retryable errors.
pub const ENV_RETRY_BUDGET: &str = "SHARDWARDEN_MAINTENANCE_RETRY_BUDGET";
/// Budget after which long operations yield and move to `SLOW_OP`, in milliseconds.
pub const ENV_SLOW_OP_THRESHOLD_MS: &str = "SHARDWARDEN_MAINTENANCE_SLOW_OP_THRESHOLD_MS";
/// How long shutdown waits for running actions, in seconds.
pub const ENV_SHUTDOWN_GRACE_SECS: &str = "SHARDWARDEN_MAINTENANCE_SHUTDOWN_GRACE_SECS";
/// Attempts made to publish a Current report before giving up for the round.
pub const ENV_REPORT_RETRY_LIMIT: &str = "SHARDWARDEN_MAINTENANCE_REPORT_RETRY_LIMIT";
/// Every n-th round diffs all databases instead of only dirty ones.
pub const ENV_FULL_ROUND_EVERY: &str = "SHARDWARDEN_MAINTENANCE_FULL_ROUND_EVERY";

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_WORKER_THREADS: usize = 4;
const DEFAULT_ERROR_COOLDOWN_SECS: u64 = 60;
const DEFAULT_RETRY_BUDGET: u32 = 3;
const DEFAULT_SLOW_OP_THRESHOLD_MS: u64 = 2_000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_REPORT_RETRY_LIMIT: u32 = 5;
const DEFAULT_FULL_ROUND_EVERY: u64 = 10;

/// One general worker plus the worker that never runs `SLOW_OP` work.
pub const MIN_WORKER_THREADS: usize = 2;

/// Settings for the maintenance feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Time between rounds when nothing wakes the loop earlier.
    pub poll_interval: Duration,
    /// Size of the worker pool.
    pub worker_threads: usize,
    /// Window during which a fatal error excludes its resource from the diff.
    pub error_cooldown: Duration,
    /// Retries for retryable execution errors before the action fails.
    pub retry_budget: u32,
    /// Operation budget handed to long operations outside `SLOW_OP`.
    pub slow_op_threshold: Duration,
    /// Time shutdown waits for running actions.
    pub shutdown_grace: Duration,
    /// Attempts to publish a Current report per round.
    pub report_retry_limit: u32,
    /// Period (in rounds) of full, non-incremental rounds.
    pub full_round_every: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            worker_threads: DEFAULT_WORKER_THREADS,
            error_cooldown: Duration::from_secs(DEFAULT_ERROR_COOLDOWN_SECS),
            retry_budget: DEFAULT_RETRY_BUDGET,
            slow_op_threshold: Duration::from_millis(DEFAULT_SLOW_OP_THRESHOLD_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            report_retry_limit: DEFAULT_REPORT_RETRY_LIMIT,
            full_round_every: DEFAULT_FULL_ROUND_EVERY,
        }
    }
}

impl MaintenanceConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not an integer or is
    /// below its minimum.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not an integer or is
    /// below its minimum.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            poll_interval: Duration::from_millis(parse_env(
                &get_env,
                ENV_POLL_INTERVAL_MS,
                DEFAULT_POLL_INTERVAL_MS,
                1,
            )?),
            worker_threads: parse_env(
                &get_env,
                ENV_WORKER_THREADS,
                DEFAULT_WORKER_THREADS,
                MIN_WORKER_THREADS,
            )?,
            error_cooldown: Duration::from_secs(parse_env(
                &get_env,
                ENV_ERROR_COOLDOWN_SECS,
                DEFAULT_ERROR_COOLDOWN_SECS,
                1,
            )?),
            // Zero means fail on the first retryable error.
            retry_budget: parse_env(&get_env, ENV_RETRY_BUDGET, DEFAULT_RETRY_BUDGET, 0)?,
            slow_op_threshold: Duration::from_millis(parse_env(
                &get_env,
                ENV_SLOW_OP_THRESHOLD_MS,
                DEFAULT_SLOW_OP_THRESHOLD_MS,
                1,
            )?),
            shutdown_grace: Duration::from_secs(parse_env(
                &get_env,
                ENV_SHUTDOWN_GRACE_SECS,
                DEFAULT_SHUTDOWN_GRACE_SECS,
                1,
            )?),
            report_retry_limit: parse_env(
                &get_env,
                ENV_REPORT_RETRY_LIMIT,
                DEFAULT_REPORT_RETRY_LIMIT,
                1,
            )?,
            full_round_every: parse_env(
                &get_env,
                ENV_FULL_ROUND_EVERY,
                DEFAULT_FULL_ROUND_EVERY,
                1,
            )?,
        })
    }
}

fn parse_env<T, F>(get_env: &F, key: &str, default: T, min: T) -> Result<T>
where
    T: FromStr + PartialOrd + Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<T>().map_err(|_| {
        Error::configuration(format!("{key} must be an integer in range, got '{raw}'"))
    })?;
    if parsed < min {
        return Err(Error::configuration(format!(
            "{key} must be at least {min}, got {parsed}"
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = MaintenanceConfig::from_env_with(|_| None).unwrap();
        assert_eq!(config, MaintenanceConfig::default());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = MaintenanceConfig::from_env_with(env(&[
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_WORKER_THREADS, "8"),
            (ENV_ERROR_COOLDOWN_SECS, "5"),
            (ENV_RETRY_BUDGET, "1"),
            (ENV_FULL_ROUND_EVERY, "3"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.error_cooldown, Duration::from_secs(5));
        assert_eq!(config.retry_budget, 1);
        assert_eq!(config.full_round_every, 3);
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        let err =
            MaintenanceConfig::from_env_with(env(&[(ENV_POLL_INTERVAL_MS, "0")])).unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        let err =
            MaintenanceConfig::from_env_with(env(&[(ENV_POLL_INTERVAL_MS, "soon")])).unwrap_err();
        assert!(err.to_string().contains("must be an integer"));
    }

    #[test]
    fn retries_can_be_disabled() {
        let config = MaintenanceConfig::from_env_with(env(&[(ENV_RETRY_BUDGET, "0")])).unwrap();
        assert_eq!(config.retry_budget, 0);
    }

    #[test]
    fn single_worker_is_rejected() {
        let err = MaintenanceConfig::from_env_with(env(&[(ENV_WORKER_THREADS, "1")])).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn oversized_retry_budget_is_rejected() {
        let err = MaintenanceConfig::from_env_with(env(&[(ENV_RETRY_BUDGET, "99999999999")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains(ENV_RETRY_BUDGET));
    }
}
