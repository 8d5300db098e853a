//! Distributor configuration.
//!
//! # Example
//!
//! ```rust
//! use alluvial_runtime::config::DistributorConfig;
//! use std::time::Duration;
//!
//! let config = DistributorConfig::default()
//!     .with_max_degree_of_parallelism(2)
//!     .with_wait_interval(Duration::from_millis(250));
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Environment
//!
//! [`DistributorConfig::from_env`] starts from the defaults and overrides
//! them from:
//!
//! | Variable | Field |
//! |---|---|
//! | `ALLUVIAL_MAX_PARALLELISM` | `max_degree_of_parallelism` |
//! | `ALLUVIAL_WAIT_INTERVAL_MS` | `wait_interval` |
//! | `ALLUVIAL_LEASE_DURATION_MS` | `lease_duration` |
//! | `ALLUVIAL_RECEIVE_TIMEOUT_MS` | `receive_timeout` |

use crate::retry::RetryPolicy;
use alluvial_core::TimeDelta;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable for [`DistributorConfig::max_degree_of_parallelism`].
pub const MAX_PARALLELISM_VAR: &str = "ALLUVIAL_MAX_PARALLELISM";
/// Environment variable for [`DistributorConfig::wait_interval`], in milliseconds.
pub const WAIT_INTERVAL_VAR: &str = "ALLUVIAL_WAIT_INTERVAL_MS";
/// Environment variable for [`DistributorConfig::lease_duration`], in milliseconds.
pub const LEASE_DURATION_VAR: &str = "ALLUVIAL_LEASE_DURATION_MS";
/// Environment variable for [`DistributorConfig::receive_timeout`], in milliseconds.
pub const RECEIVE_TIMEOUT_VAR: &str = "ALLUVIAL_RECEIVE_TIMEOUT_MS";

/// Invalid distributor configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        /// The variable name.
        var: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A setting that must be positive was zero.
    #[error("{field} must be greater than zero")]
    Zero {
        /// The offending setting.
        field: &'static str,
    },
}

/// Settings for a [`Distributor`](crate::Distributor).
///
/// # Default Values
///
/// - `max_degree_of_parallelism`: 5 (capped at the pool size)
/// - `wait_interval`: 1 second, both the idle back-off and the post-release
///   cooldown of a resource
/// - `lease_duration`: 1 minute
/// - `receive_timeout`: 10 minutes
/// - `release_retry`: [`RetryPolicy::default`]
#[derive(Debug, Clone, PartialEq)]
pub struct DistributorConfig {
    /// Maximum number of worker loops.
    pub max_degree_of_parallelism: usize,
    /// Sleep between empty acquisition attempts, and the cooldown before a
    /// released resource can be granted again.
    pub wait_interval: Duration,
    /// How long each lease lasts unless extended.
    pub lease_duration: Duration,
    /// Hard cap on a single receiver invocation.
    pub receive_timeout: Duration,
    /// Retry policy for releasing leases.
    pub release_retry: RetryPolicy,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 5,
            wait_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(600),
            release_retry: RetryPolicy::default(),
        }
    }
}

impl DistributorConfig {
    /// Set the maximum number of worker loops.
    #[must_use]
    pub const fn with_max_degree_of_parallelism(mut self, max: usize) -> Self {
        self.max_degree_of_parallelism = max;
        self
    }

    /// Set the wait interval.
    #[must_use]
    pub const fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Set the lease duration.
    #[must_use]
    pub const fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the receive timeout.
    #[must_use]
    pub const fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the release retry policy.
    #[must_use]
    pub fn with_release_retry(mut self, policy: RetryPolicy) -> Self {
        self.release_retry = policy;
        self
    }

    /// Load from the process environment. See the [module docs](self).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable or zero values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from any variable source, for example a parsed config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable or zero values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(max) = parse_var::<usize>(&lookup, MAX_PARALLELISM_VAR)? {
            config.max_degree_of_parallelism = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, WAIT_INTERVAL_VAR)? {
            config.wait_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, LEASE_DURATION_VAR)? {
            config.lease_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, RECEIVE_TIMEOUT_VAR)? {
            config.receive_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the settings make sense together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] if the parallelism, lease duration or
    /// receive timeout is zero.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.max_degree_of_parallelism == 0 {
            return Err(ConfigError::Zero {
                field: "max_degree_of_parallelism",
            });
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Zero {
                field: "lease_duration",
            });
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "receive_timeout",
            });
        }
        Ok(())
    }

    /// The lease duration as a signed span.
    #[must_use]
    pub fn lease_time(&self) -> TimeDelta {
        to_time_delta(self.lease_duration)
    }

    /// The post-release cooldown as a signed span.
    #[must_use]
    pub fn cooldown(&self) -> TimeDelta {
        to_time_delta(self.wait_interval)
    }
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}
