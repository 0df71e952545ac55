//! MoatMachines - Per-resource call admission and fault tolerance
//!
//! This crate guards calls per logical resource (a method, one argument value
//! of a method, a group of methods, or every method matching a pattern) with:
//! - Lock-free cycle-based rate limiting with bounded wait
//! - Concurrency limiting with slots released on completion or rejection
//! - Circuit breakers driven by a ring buffer of recent outcomes
//!   (Closed → Open → HalfOpen, plus forced open / disabled)
//! - Class-based retry with exponential backoff
//! - Fallback dispatch to the handler best matching the failure's class
//! - Live reconfiguration that updates, resets or removes moats in place
//!
//! # Example
//!
//! ```rust
//! use moat_machines::{
//!     CircuitBreakerConfig, Fallback, Invocation, MoatKeeper, RateLimitConfig,
//!     ResourceConfig, ResourceId,
//! };
//! use std::time::Duration;
//!
//! let keeper = MoatKeeper::builder()
//!     .resource(
//!         ResourceId::method("payment.charge"),
//!         ResourceConfig::new()
//!             .with_rate_limit(RateLimitConfig::new(100, Duration::from_secs(1)))
//!             .with_circuit_breaker(CircuitBreakerConfig::default()),
//!     )
//!     .fallback(
//!         ResourceId::method("payment.charge"),
//!         Fallback::<u64, String>::to_value("queued".to_string()),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let receipt = keeper.execute(
//!     &Invocation::new("payment.charge").with_arg(0, "tenant", "acme"),
//!     &4200u64,
//!     |cents| Ok(format!("charged {cents}")),
//! );
//! assert_eq!(receipt.unwrap(), "charged 4200");
//! ```

pub mod builder;
pub mod bulkhead;
pub mod callbacks;
pub mod chain;
pub mod circuit;
pub mod class;
pub mod classifier;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod handle;
pub mod keeper;
pub mod metrics;
pub mod moat;
pub mod rate_limiter;
pub mod resource;
pub mod retry;
pub mod ring_bits;
pub mod store;
pub mod updater;

pub use builder::MoatKeeperBuilder;
pub use bulkhead::{ConcurrencyPermit, ConcurrentLimiter};
pub use callbacks::{Callbacks, Listeners, StateTransition};
pub use chain::ExecutionChain;
pub use circuit::{CircuitBreaker, CircuitState};
pub use class::{ClassRegistry, ErrorClass};
pub use classifier::{
    CombinedClassifier, DefaultClassifier, ErrorClassifier, FailureClassifier, FailureContext,
    PredicateClassifier, SlowCallClassifier,
};
pub use cluster::{ArgStatistics, ClusterEvent, ClusterRegistry, MoatCluster};
pub use config::{
    CircuitBreakerConfig, ConcurrentLimitConfig, EngineConfig, ExternalConfig, ForcedState,
    MoatConfig, RateLimitConfig, ResourceConfig, RetryConfig,
};
pub use errors::{BoxError, ConfigError, MoatError, NotPermitted, ServiceError};
pub use fallback::Fallback;
pub use handle::{InvocationListener, Outcome, RequestHandle};
pub use keeper::{Invocation, MoatKeeper};
pub use metrics::{CircuitBreakerMetrics, ClusterMetrics, MoatMetrics, MoatSnapshot, RetryMetrics};
pub use moat::{Lifecycle, Moat, MoatKind};
pub use rate_limiter::RateLimiter;
pub use resource::{ArgResourceId, MATCH_ALL, ResourceId};
pub use retry::{RetryContext, RetryExecutor};
pub use store::ConfigMap;
pub use updater::{ConfigSource, CreationGuard, MaxValuesPerArg};
