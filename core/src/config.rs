//! Configuration values
//!
//! Every engine config is a plain value. A moat keeps two of them: the
//! immutable baseline it was created with and the working config, which is
//! replaced wholesale (never mutated field by field) when dynamic
//! configuration changes.

use crate::class::ErrorClass;
use crate::errors::ConfigError;
use crate::moat::MoatKind;
use crate::resource::ResourceId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Permits granted per refresh cycle
    pub limit_for_period: usize,
    /// Length of one refresh cycle
    pub limit_refresh_period: Duration,
    /// How long admission may wait for a permit (zero = fail fast)
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_secs(1),
            max_wait: Duration::ZERO,
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit_for_period: usize, limit_refresh_period: Duration) -> Self {
        Self {
            limit_for_period,
            limit_refresh_period,
            max_wait: Duration::ZERO,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::Zero {
                field: "limit_for_period",
            });
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigError::Zero {
                field: "limit_refresh_period",
            });
        }
        Ok(())
    }
}

/// Concurrency limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentLimitConfig {
    /// Maximum number of calls in flight
    pub threshold: usize,
}

impl Default for ConcurrentLimitConfig {
    fn default() -> Self {
        Self { threshold: 100 }
    }
}

impl ConcurrentLimitConfig {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::Zero { field: "threshold" });
        }
        Ok(())
    }
}

/// States a circuit breaker can be pinned to by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedState {
    /// Reject every call
    Open,
    /// Permit every call and record nothing
    Disabled,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate in percent (0-100] at which the breaker opens
    pub failure_rate_threshold: f32,

    /// Outcomes kept while closed
    pub ring_buffer_size_in_closed_state: usize,

    /// Outcomes kept while half-open (the trial window)
    pub ring_buffer_size_in_half_open_state: usize,

    /// How long the breaker stays open before probing
    pub wait_duration_in_open_state: Duration,

    /// Jitter factor for the open-state wait (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Calls slower than this count as failures
    pub max_spend_time: Option<Duration>,

    /// Error classes that never count as failures
    pub ignore_classes: Vec<ErrorClass>,

    /// Pin the breaker open or disabled
    pub forced_state: Option<ForcedState>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            ring_buffer_size_in_closed_state: 100,
            ring_buffer_size_in_half_open_state: 10,
            wait_duration_in_open_state: Duration::from_secs(60),
            jitter_factor: 0.0,
            max_spend_time: None,
            ignore_classes: Vec::new(),
            forced_state: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::OutOfRange {
                field: "failure_rate_threshold",
                min: 0.0,
                max: 100.0,
                value: self.failure_rate_threshold as f64,
            });
        }
        if self.ring_buffer_size_in_closed_state == 0 {
            return Err(ConfigError::Zero {
                field: "ring_buffer_size_in_closed_state",
            });
        }
        if self.ring_buffer_size_in_half_open_state == 0 {
            return Err(ConfigError::Zero {
                field: "ring_buffer_size_in_half_open_state",
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::OutOfRange {
                field: "jitter_factor",
                min: 0.0,
                max: 1.0,
                value: self.jitter_factor,
            });
        }
        Ok(())
    }

    /// True when switching from `self` to `next` needs a fresh breaker state
    pub fn restarts_state(&self, next: &CircuitBreakerConfig) -> bool {
        self.ring_buffer_size_in_closed_state != next.ring_buffer_size_in_closed_state
            || self.ring_buffer_size_in_half_open_state != next.ring_buffer_size_in_half_open_state
            || self.wait_duration_in_open_state != next.wait_duration_in_open_state
            || self.forced_state != next.forced_state
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Classes that are retried (with all their subclasses)
    pub include: Vec<ErrorClass>,
    /// Classes that are never retried (with all their subclasses)
    pub exclude: Vec<ErrorClass>,
    /// Base backoff delay
    pub delay: Duration,
    /// Upper bound for the backoff delay
    pub max_delay: Duration,
    /// Backoff growth factor per attempt
    pub multiplier: f64,
    /// Jitter factor for the backoff (0.0 = exact)
    pub jitter_factor: f64,
    /// How deep the cause chain is searched for a listed class
    pub max_cause_depth: usize,
    /// Verdict for errors no table entry resolves
    pub retry_unknown: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            include: Vec::new(),
            exclude: vec![ErrorClass::NOT_PERMITTED],
            delay: Duration::ZERO,
            max_delay: Duration::from_secs(10),
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_cause_depth: 5,
            retry_unknown: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "multiplier",
                min: 1.0,
                max: f64::MAX,
                value: self.multiplier,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::OutOfRange {
                field: "jitter_factor",
                min: 0.0,
                max: 1.0,
                value: self.jitter_factor,
            });
        }
        Ok(())
    }
}

/// One engine's configuration, tagged by kind
#[derive(Debug, Clone, PartialEq)]
pub enum EngineConfig {
    RateLimit(RateLimitConfig),
    ConcurrentLimit(ConcurrentLimitConfig),
    CircuitBreaker(CircuitBreakerConfig),
}

impl EngineConfig {
    pub fn kind(&self) -> MoatKind {
        match self {
            EngineConfig::RateLimit(_) => MoatKind::RateLimit,
            EngineConfig::ConcurrentLimit(_) => MoatKind::ConcurrentLimit,
            EngineConfig::CircuitBreaker(_) => MoatKind::CircuitBreaker,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            EngineConfig::RateLimit(c) => c.validate(),
            EngineConfig::ConcurrentLimit(c) => c.validate(),
            EngineConfig::CircuitBreaker(c) => c.validate(),
        }
    }
}

/// Per-resource configuration: at most one config per engine kind
///
/// Used both as the immutable baseline registered at startup and as the
/// dynamic override delivered by a config source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub rate_limit: Option<RateLimitConfig>,
    pub concurrent_limit: Option<ConcurrentLimitConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: Option<RetryConfig>,
}

/// Dynamic per-resource override as delivered by a config source
pub type ExternalConfig = ResourceConfig;

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_concurrent_limit(mut self, config: ConcurrentLimitConfig) -> Self {
        self.concurrent_limit = Some(config);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rate_limit.is_none()
            && self.concurrent_limit.is_none()
            && self.circuit_breaker.is_none()
            && self.retry.is_none()
    }

    /// Config for one engine kind
    pub fn engine(&self, kind: MoatKind) -> Option<EngineConfig> {
        match kind {
            MoatKind::RateLimit => self.rate_limit.clone().map(EngineConfig::RateLimit),
            MoatKind::ConcurrentLimit => self
                .concurrent_limit
                .clone()
                .map(EngineConfig::ConcurrentLimit),
            MoatKind::CircuitBreaker => self
                .circuit_breaker
                .clone()
                .map(EngineConfig::CircuitBreaker),
        }
    }

    /// Engine configs in admission order
    pub fn engines(&self) -> Vec<EngineConfig> {
        MoatKind::ALL
            .iter()
            .filter_map(|kind| self.engine(*kind))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for engine in self.engines() {
            engine.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// Type-erased fallback shared by every moat of a resource.
/// Holds a `crate::fallback::Fallback<A, T>` for the resource's call signature.
pub type SharedFallback = Arc<dyn Any + Send + Sync>;

/// Immutable per-resource structural data, fixed when the cluster is built
#[derive(Clone)]
pub struct MoatConfig {
    pub resource: ResourceId,
    pub fallback: Option<SharedFallback>,
}

impl MoatConfig {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: SharedFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl std::fmt::Debug for MoatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoatConfig")
            .field("resource", &self.resource)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ResourceConfig::new()
            .with_rate_limit(RateLimitConfig::default())
            .with_concurrent_limit(ConcurrentLimitConfig::default())
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_retry(RetryConfig::default());

        assert!(config.validate().is_ok());
        assert_eq!(config.engines().len(), 3);
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let config =
            ResourceConfig::new().with_rate_limit(RateLimitConfig::new(0, Duration::from_secs(1)));
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "limit_for_period"
            })
        );

        assert!(ConcurrentLimitConfig::new(0).validate().is_err());
    }

    #[test]
    fn test_failure_rate_threshold_range() {
        let config = CircuitBreakerConfig {
            failure_rate_threshold: 120.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "failure_rate_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_engines_follow_admission_order() {
        let config = ResourceConfig::new()
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_rate_limit(RateLimitConfig::default());

        let kinds: Vec<MoatKind> = config.engines().iter().map(EngineConfig::kind).collect();
        assert_eq!(kinds, vec![MoatKind::RateLimit, MoatKind::CircuitBreaker]);
    }

    #[test]
    fn test_restarts_state_only_for_structural_changes() {
        let base = CircuitBreakerConfig::default();
        let threshold_only = CircuitBreakerConfig {
            failure_rate_threshold: 80.0,
            ..base.clone()
        };
        let forced = CircuitBreakerConfig {
            forced_state: Some(ForcedState::Open),
            ..base.clone()
        };

        assert!(!base.restarts_state(&threshold_only));
        assert!(base.restarts_state(&forced));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = r#"{
            "rate_limit": { "limit_for_period": 5 },
            "circuit_breaker": { "forced_state": "open", "ignore_classes": ["biz.validation"] }
        }"#;
        let config: ResourceConfig = serde_json::from_str(json).unwrap();

        let rate = config.rate_limit.unwrap();
        assert_eq!(rate.limit_for_period, 5);
        assert_eq!(rate.limit_refresh_period, Duration::from_secs(1));

        let breaker = config.circuit_breaker.unwrap();
        assert_eq!(breaker.forced_state, Some(ForcedState::Open));
        assert_eq!(breaker.ignore_classes, vec![ErrorClass::new("biz.validation")]);
        assert!(config.retry.is_none());
    }
}
