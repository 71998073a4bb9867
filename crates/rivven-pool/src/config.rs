//! Pool configuration
//!
//! Time-valued settings are written in whole seconds when serialized and held
//! as [`Duration`] in memory. Counts and timeouts can never go negative: a
//! negative value read from a configuration source is clamped to zero.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration snapshot for a [`ConnectionPool`](crate::pool::ConnectionPool)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, used as the pool identifier in log events
    pub name: Option<String>,
    /// Low-water mark kept open by the grow loop
    #[serde(with = "clamped_count")]
    pub min_connections: usize,
    /// High-water mark (0 = unbounded)
    #[serde(with = "clamped_count")]
    pub max_connections: usize,
    /// Maximum time a borrow waits for a connection (0 = use `request_timeout`)
    #[serde(with = "secs")]
    pub connection_timeout: Duration,
    /// Fallback for a zero `connection_timeout`
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// Check the resource through the factory on every borrow
    pub validate_on_borrow: bool,
    /// Maximum time a validation check may take (0 = use the connection timeout)
    #[serde(with = "secs")]
    pub validation_timeout: Duration,
    /// First backoff after an open failure (0 falls back to one second)
    #[serde(with = "secs")]
    pub backoff_period: Duration,
    /// Growth factor applied to the backoff after each further failure
    #[serde(with = "clamped_factor")]
    pub backoff_multiplier: f64,
    /// Upper bound for the backoff (0 = no limit)
    #[serde(with = "secs")]
    pub backoff_limit: Duration,
    /// Minimum time between two prune passes (0 disables pruning)
    #[serde(with = "secs")]
    pub inactivity_timeout: Duration,
    /// Age after which a connection is retired on borrow (0 = never)
    #[serde(with = "secs")]
    pub max_lifetime: Duration,
    /// How often the prune loop wakes up (0 disables pruning)
    #[serde(with = "secs")]
    pub prune_interval: Duration,
    /// Capacity of the retirement queue (0 = unbounded)
    #[serde(with = "clamped_count")]
    pub retire_queue_capacity: usize,
}

/// Backoff after an open failure when none is configured
const DEFAULT_BACKOFF_PERIOD: Duration = Duration::from_secs(1);

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: None,
            min_connections: 0,
            max_connections: 1000,
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            validate_on_borrow: false,
            validation_timeout: Duration::from_secs(5),
            backoff_period: DEFAULT_BACKOFF_PERIOD,
            backoff_multiplier: 1.0,
            backoff_limit: Duration::ZERO,
            inactivity_timeout: Duration::from_secs(300),
            max_lifetime: Duration::ZERO,
            prune_interval: Duration::from_secs(5),
            retire_queue_capacity: 0,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a validating builder
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set minimum pool size
    pub fn with_min_connections(mut self, count: usize) -> Self {
        self.min_connections = count;
        self
    }

    /// Set maximum pool size (0 = unbounded)
    pub fn with_max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set borrow timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable/disable full validation on borrow
    pub fn with_validate_on_borrow(mut self, validate: bool) -> Self {
        self.validate_on_borrow = validate;
        self
    }

    /// Set validation check timeout
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set initial backoff period
    pub fn with_backoff_period(mut self, period: Duration) -> Self {
        self.backoff_period = period;
        self
    }

    /// Set backoff multiplier, clamped to `[0, f64::MAX]`
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = clamp_factor(multiplier);
        self
    }

    /// Set backoff limit (0 = no limit)
    pub fn with_backoff_limit(mut self, limit: Duration) -> Self {
        self.backoff_limit = limit;
        self
    }

    /// Set inactivity timeout
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime (0 = never)
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set prune interval
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Set retirement queue capacity (0 = unbounded)
    pub fn with_retire_queue_capacity(mut self, capacity: usize) -> Self {
        self.retire_queue_capacity = capacity;
        self
    }

    /// Check the relationship between the sizing fields
    pub fn validate(&self) -> Result<()> {
        if self.max_connections > 0 && self.min_connections > self.max_connections {
            return Err(Error::config(format!(
                "minimum number of connections ({}) may not be more than maximum ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Upper bound on open connections, with 0 mapped to "no limit"
    pub fn max_connections_limit(&self) -> usize {
        if self.max_connections == 0 {
            usize::MAX
        } else {
            self.max_connections
        }
    }

    /// Borrow timeout actually applied
    pub fn effective_connection_timeout(&self) -> Duration {
        if self.connection_timeout.is_zero() {
            self.request_timeout
        } else {
            self.connection_timeout
        }
    }

    /// Validation timeout actually applied
    pub fn effective_validation_timeout(&self) -> Duration {
        if self.validation_timeout.is_zero() {
            self.effective_connection_timeout()
        } else {
            self.validation_timeout
        }
    }

    /// Backoff period actually applied; zero falls back to one second
    pub fn effective_backoff_period(&self) -> Duration {
        if self.backoff_period.is_zero() {
            DEFAULT_BACKOFF_PERIOD
        } else {
            self.backoff_period
        }
    }

    /// Whether the prune loop has anything to do
    pub fn pruning_enabled(&self) -> bool {
        !self.inactivity_timeout.is_zero() && !self.prune_interval.is_zero()
    }
}

/// Pool builder for fluent configuration
///
/// Unlike the `with_*` setters on [`PoolConfig`], [`PoolBuilder::build`]
/// rejects an inconsistent configuration up front.
#[derive(Debug, Clone, Default)]
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pool name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set minimum pool size
    pub fn min_connections(mut self, count: usize) -> Self {
        self.config.min_connections = count;
        self
    }

    /// Set maximum pool size
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set borrow timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Enable full validation on borrow
    pub fn validate_on_borrow(mut self, validate: bool) -> Self {
        self.config.validate_on_borrow = validate;
        self
    }

    /// Set validation check timeout
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.validation_timeout = timeout;
        self
    }

    /// Set backoff parameters
    pub fn backoff(mut self, period: Duration, multiplier: f64, limit: Duration) -> Self {
        self.config.backoff_period = period;
        self.config.backoff_multiplier = clamp_factor(multiplier);
        self.config.backoff_limit = limit;
        self
    }

    /// Set pruning parameters
    pub fn pruning(mut self, inactivity_timeout: Duration, prune_interval: Duration) -> Self {
        self.config.inactivity_timeout = inactivity_timeout;
        self.config.prune_interval = prune_interval;
        self
    }

    /// Set max lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_lifetime = lifetime;
        self
    }

    /// Set retirement queue capacity
    pub fn retire_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.retire_queue_capacity = capacity;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn clamp_factor(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, f64::MAX)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs.max(0) as u64))
    }
}

mod clamped_count {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &usize, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
        let count = i64::deserialize(deserializer)?;
        Ok(usize::try_from(count.max(0)).unwrap_or(usize::MAX))
    }
}

mod clamped_factor {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(super::clamp_factor(f64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_above_max_rejected() {
        let result = PoolBuilder::new()
            .min_connections(5)
            .max_connections(2)
            .build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_unbounded_max_accepts_any_min() {
        let config = PoolBuilder::new()
            .min_connections(50)
            .max_connections(0)
            .build()
            .unwrap();
        assert_eq!(config.max_connections_limit(), usize::MAX);
    }

    #[test]
    fn test_timeout_fallbacks() {
        let config = PoolConfig::new()
            .with_connection_timeout(Duration::ZERO)
            .with_request_timeout(Duration::from_secs(7))
            .with_validation_timeout(Duration::ZERO);
        assert_eq!(config.effective_connection_timeout(), Duration::from_secs(7));
        assert_eq!(config.effective_validation_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn test_zero_backoff_period_falls_back() {
        let config = PoolConfig::new().with_backoff_period(Duration::ZERO);
        assert_eq!(config.effective_backoff_period(), Duration::from_secs(1));

        let config = PoolConfig::new().with_backoff_period(Duration::from_millis(20));
        assert_eq!(config.effective_backoff_period(), Duration::from_millis(20));
    }

    #[test]
    fn test_multiplier_clamped() {
        assert_eq!(PoolConfig::new().with_backoff_multiplier(-3.0).backoff_multiplier, 0.0);
        assert_eq!(PoolConfig::new().with_backoff_multiplier(f64::NAN).backoff_multiplier, 0.0);
        assert_eq!(PoolConfig::new().with_backoff_multiplier(2.5).backoff_multiplier, 2.5);
    }
}
