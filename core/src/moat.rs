//! Moats: one protection engine bound to one resource
//!
//! A [`Moat`] wraps exactly one engine and gives the cluster a uniform
//! admission and outcome contract. Admission hands back a [`Ticket`]: for the
//! concurrency limiter the ticket *is* the held slot and releases it when
//! dropped, for the circuit breaker it remembers the state the call was
//! admitted in, and for the rate limiter it carries nothing because a granted
//! permit is consumed on the spot.

use crate::bulkhead::{ConcurrencyPermit, ConcurrentLimiter};
use crate::callbacks::Callbacks;
use crate::circuit::{BreakerTicket, CircuitBreaker};
use crate::class::ClassRegistry;
use crate::classifier::{FailureClassifier, FailureContext};
use crate::config::{EngineConfig, MoatConfig};
use crate::errors::NotPermitted;
use crate::fallback::Fallback;
use crate::metrics::MoatMetrics;
use crate::rate_limiter::RateLimiter;
use crate::resource::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Engine kind; the derive order is the admission order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MoatKind {
    RateLimit,
    ConcurrentLimit,
    CircuitBreaker,
}

impl MoatKind {
    /// Every kind in admission order
    pub const ALL: [MoatKind; 3] = [
        MoatKind::RateLimit,
        MoatKind::ConcurrentLimit,
        MoatKind::CircuitBreaker,
    ];

    /// Position in the admission order
    pub fn order(self) -> u8 {
        match self {
            MoatKind::RateLimit => 0,
            MoatKind::ConcurrentLimit => 1,
            MoatKind::CircuitBreaker => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MoatKind::RateLimit => "rate_limit",
            MoatKind::ConcurrentLimit => "concurrent_limit",
            MoatKind::CircuitBreaker => "circuit_breaker",
        }
    }
}

impl fmt::Display for MoatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a moat lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Lives as long as its cluster; reverts to its baseline when the dynamic
    /// override is withdrawn
    Permanent,
    /// Exists only while a dynamic config grants it
    Temporary,
}

/// The engine a moat wraps
#[derive(Debug)]
pub enum Engine {
    RateLimit(RateLimiter),
    ConcurrentLimit(Arc<ConcurrentLimiter>),
    CircuitBreaker(CircuitBreaker),
}

impl Engine {
    pub fn kind(&self) -> MoatKind {
        match self {
            Engine::RateLimit(_) => MoatKind::RateLimit,
            Engine::ConcurrentLimit(_) => MoatKind::ConcurrentLimit,
            Engine::CircuitBreaker(_) => MoatKind::CircuitBreaker,
        }
    }
}

/// Shared pieces every engine of a keeper is built with
#[derive(Debug, Clone, Default)]
pub struct EngineParts {
    pub registry: ClassRegistry,
    pub classifier: Option<Arc<dyn FailureClassifier>>,
    pub callbacks: Callbacks,
}

impl EngineParts {
    /// Build the engine `config` describes
    pub fn build(&self, name: &str, config: EngineConfig) -> Engine {
        match config {
            EngineConfig::RateLimit(c) => Engine::RateLimit(RateLimiter::new(name, c)),
            EngineConfig::ConcurrentLimit(c) => {
                Engine::ConcurrentLimit(Arc::new(ConcurrentLimiter::new(name, c)))
            }
            EngineConfig::CircuitBreaker(c) => Engine::CircuitBreaker(CircuitBreaker::with_parts(
                name,
                c,
                self.registry.clone(),
                self.classifier.clone(),
                self.callbacks.clone(),
            )),
        }
    }
}

/// Proof of admission by one moat
#[derive(Debug)]
pub enum Ticket {
    /// Nothing to hold or report
    Empty,
    /// A held concurrency slot
    Permit(ConcurrencyPermit),
    /// Breaker admission to report the outcome against
    Breaker(BreakerTicket),
}

/// One protection unit for one resource
#[derive(Debug)]
pub struct Moat {
    config: MoatConfig,
    lifecycle: Lifecycle,
    /// Config the moat reverts to; only permanent moats have one
    baseline: Option<EngineConfig>,
    engine: Engine,
}

impl Moat {
    /// A moat living as long as its cluster, created from its immutable baseline
    pub fn permanent(config: MoatConfig, baseline: EngineConfig, parts: &EngineParts) -> Self {
        let engine = parts.build(&config.resource.to_string(), baseline.clone());
        Self {
            config,
            lifecycle: Lifecycle::Permanent,
            baseline: Some(baseline),
            engine,
        }
    }

    /// A moat that only exists while dynamic config grants it
    pub fn temporary(config: MoatConfig, dynamic: EngineConfig, parts: &EngineParts) -> Self {
        let engine = parts.build(&config.resource.to_string(), dynamic);
        Self {
            config,
            lifecycle: Lifecycle::Temporary,
            baseline: None,
            engine,
        }
    }

    pub fn kind(&self) -> MoatKind {
        self.engine.kind()
    }

    pub fn order(&self) -> u8 {
        self.kind().order()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn resource(&self) -> &ResourceId {
        &self.config.resource
    }

    pub fn config(&self) -> &MoatConfig {
        &self.config
    }

    pub fn baseline(&self) -> Option<&EngineConfig> {
        self.baseline.as_ref()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        match &self.engine {
            Engine::CircuitBreaker(cb) => Some(cb),
            _ => None,
        }
    }

    /// Admission check
    pub fn try_enter(&self) -> Result<Ticket, NotPermitted> {
        let admitted = match &self.engine {
            Engine::RateLimit(rl) => rl
                .acquire(rl.config().max_wait)
                .then_some(Ticket::Empty),
            Engine::ConcurrentLimit(cl) => cl.try_acquire().map(Ticket::Permit),
            Engine::CircuitBreaker(cb) => cb.try_acquire().map(Ticket::Breaker),
        };
        admitted.ok_or_else(|| {
            tracing::debug!(resource = %self.config.resource, kind = %self.kind(), "call not permitted");
            NotPermitted {
                resource: self.config.resource.clone(),
                kind: self.kind(),
                metrics: self.metrics(),
            }
        })
    }

    /// Report the outcome of an admitted call; consumes (and releases) the ticket
    pub fn on_exit(&self, ticket: Ticket, ctx: &FailureContext<'_>) {
        if let (Engine::CircuitBreaker(cb), Ticket::Breaker(ticket)) = (&self.engine, &ticket) {
            cb.on_complete(ticket, ctx);
        }
    }

    /// Swap the working config; `false` when `config` is for another engine kind
    pub fn update(&self, config: &EngineConfig) -> bool {
        match (&self.engine, config) {
            (Engine::RateLimit(rl), EngineConfig::RateLimit(c)) => rl.change_config(c.clone()),
            (Engine::ConcurrentLimit(cl), EngineConfig::ConcurrentLimit(c)) => {
                cl.change_config(c.clone())
            }
            (Engine::CircuitBreaker(cb), EngineConfig::CircuitBreaker(c)) => {
                cb.change_config(c.clone())
            }
            _ => return false,
        }
        true
    }

    /// Revert to the immutable baseline; no-op for temporary moats
    pub fn reset_to_baseline(&self) -> bool {
        match &self.baseline {
            Some(baseline) => self.update(baseline),
            None => false,
        }
    }

    /// Resource-level fallback for calls of signature `(A) -> T`
    pub fn fallback<A: 'static, T: 'static>(&self) -> Option<&Fallback<A, T>> {
        self.config
            .fallback
            .as_ref()
            .and_then(|f| f.downcast_ref::<Fallback<A, T>>())
    }

    pub fn metrics(&self) -> MoatMetrics {
        match &self.engine {
            Engine::RateLimit(rl) => MoatMetrics::RateLimit {
                waiting_threads: rl.waiting_threads(),
                available_permissions: rl.available_permissions(),
            },
            Engine::ConcurrentLimit(cl) => MoatMetrics::ConcurrentLimit {
                threshold: cl.threshold(),
                current_call_count: cl.current_call_count(),
            },
            Engine::CircuitBreaker(cb) => MoatMetrics::CircuitBreaker(cb.metrics()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::config::{CircuitBreakerConfig, ConcurrentLimitConfig, RateLimitConfig};
    use std::time::Duration;

    fn moat_config() -> MoatConfig {
        MoatConfig::new(ResourceId::method("svc"))
    }

    #[test]
    fn test_kind_order_matches_admission_order() {
        let mut kinds = vec![
            MoatKind::CircuitBreaker,
            MoatKind::RateLimit,
            MoatKind::ConcurrentLimit,
        ];
        kinds.sort();
        assert_eq!(kinds, MoatKind::ALL.to_vec());
        assert!(MoatKind::RateLimit.order() < MoatKind::CircuitBreaker.order());
    }

    #[test]
    fn test_rejection_carries_metrics() {
        let moat = Moat::permanent(
            moat_config(),
            EngineConfig::ConcurrentLimit(ConcurrentLimitConfig::new(1)),
            &EngineParts::default(),
        );

        let _held = moat.try_enter().unwrap();
        let rejected = moat.try_enter().unwrap_err();
        assert_eq!(rejected.kind, MoatKind::ConcurrentLimit);
        assert_eq!(
            rejected.metrics,
            MoatMetrics::ConcurrentLimit {
                threshold: 1,
                current_call_count: 1
            }
        );
    }

    #[test]
    fn test_dropping_ticket_releases_slot() {
        let moat = Moat::temporary(
            moat_config(),
            EngineConfig::ConcurrentLimit(ConcurrentLimitConfig::new(1)),
            &EngineParts::default(),
        );

        let ticket = moat.try_enter().unwrap();
        moat.on_exit(ticket, &FailureContext::success("svc", Duration::ZERO));
        assert!(moat.try_enter().is_ok());
    }

    #[test]
    fn test_reset_to_baseline_restores_config() {
        let moat = Moat::permanent(
            moat_config(),
            EngineConfig::RateLimit(RateLimitConfig::new(10, Duration::from_secs(1))),
            &EngineParts::default(),
        );

        assert!(moat.update(&EngineConfig::RateLimit(RateLimitConfig::new(
            2,
            Duration::from_secs(1)
        ))));
        assert!(moat.reset_to_baseline());
        match moat.engine() {
            Engine::RateLimit(rl) => assert_eq!(rl.config().limit_for_period, 10),
            other => panic!("unexpected engine {other:?}"),
        }
    }

    #[test]
    fn test_update_rejects_other_kind() {
        let moat = Moat::temporary(
            moat_config(),
            EngineConfig::ConcurrentLimit(ConcurrentLimitConfig::new(1)),
            &EngineParts::default(),
        );

        assert!(!moat.update(&EngineConfig::CircuitBreaker(
            CircuitBreakerConfig::default()
        )));
        assert!(!moat.reset_to_baseline());
    }

    #[test]
    fn test_breaker_outcome_reaches_ring() {
        let moat = Moat::permanent(
            moat_config(),
            EngineConfig::CircuitBreaker(CircuitBreakerConfig {
                ring_buffer_size_in_closed_state: 1,
                ..Default::default()
            }),
            &EngineParts::default(),
        );
        let err = std::fmt::Error;

        let ticket = moat.try_enter().unwrap();
        moat.on_exit(ticket, &FailureContext::failure("svc", &err, Duration::ZERO));

        assert_eq!(
            moat.circuit_breaker().map(CircuitBreaker::state),
            Some(CircuitState::Open)
        );
        assert_eq!(moat.try_enter().unwrap_err().kind, MoatKind::CircuitBreaker);
    }
}
