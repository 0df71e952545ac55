//! Bounded retry around a protected call
//!
//! The executor runs the inner call (a full admission + call + completion
//! cycle) until it succeeds, the failure is not retryable, or the attempts
//! run out. Whether a failure is retryable is decided by class tables:
//!
//! 1. the failure's class and then each superclass is looked up in the
//!    exclude and include tables (nearest listed class wins, exclude wins a
//!    tie at the same level); class verdicts are memoized,
//! 2. failing that, the cause chain is searched the same way up to
//!    `max_cause_depth` levels,
//! 3. failing that, `retry_unknown` decides.
//!
//! Backoff before attempt `n + 1` is `delay * multiplier^(n - 1)` capped at
//! `max_delay`, computed by `chrono_machines`. The first attempt never waits.

use crate::class::{ClassRegistry, ErrorClass};
use crate::config::RetryConfig;
use crate::errors::MoatError;
use crate::metrics::RetryMetrics;
use crate::moat::Lifecycle;
use crate::resource::ResourceId;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// State of one retried call
#[derive(Debug, Default)]
pub struct RetryContext {
    attempts: u32,
    last: Option<MoatError>,
}

impl RetryContext {
    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Failure of the latest attempt
    pub fn last_error(&self) -> Option<&MoatError> {
        self.last.as_ref()
    }
}

/// Retry executor attached to one resource
#[derive(Debug)]
pub struct RetryExecutor {
    resource: ResourceId,
    lifecycle: Lifecycle,
    baseline: Option<RetryConfig>,
    config: ArcSwap<RetryConfig>,
    registry: ClassRegistry,
    /// Table verdict per class; `None` = no table entry applies
    verdicts: DashMap<ErrorClass, Option<bool>>,
    total_calls: AtomicU64,
    total_retries: AtomicU64,
    exhausted: AtomicU64,
}

impl RetryExecutor {
    pub fn new(resource: ResourceId, config: RetryConfig, registry: ClassRegistry) -> Self {
        Self::build(resource, Lifecycle::Temporary, None, config, registry)
    }

    /// Executor living as long as its cluster, reverting to `baseline`
    pub fn permanent(resource: ResourceId, baseline: RetryConfig, registry: ClassRegistry) -> Self {
        Self::build(
            resource,
            Lifecycle::Permanent,
            Some(baseline.clone()),
            baseline,
            registry,
        )
    }

    fn build(
        resource: ResourceId,
        lifecycle: Lifecycle,
        baseline: Option<RetryConfig>,
        config: RetryConfig,
        registry: ClassRegistry,
    ) -> Self {
        Self {
            resource,
            lifecycle,
            baseline,
            config: ArcSwap::from_pointee(config),
            registry,
            verdicts: DashMap::new(),
            total_calls: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn config(&self) -> Arc<RetryConfig> {
        self.config.load_full()
    }

    pub fn change_config(&self, config: RetryConfig) {
        self.config.store(Arc::new(config));
        self.verdicts.clear();
        tracing::debug!(resource = %self.resource, "retry config changed");
    }

    /// Revert to the immutable baseline; no-op for temporary executors
    pub fn reset_to_baseline(&self) -> bool {
        match &self.baseline {
            Some(baseline) => {
                self.change_config(baseline.clone());
                true
            }
            None => false,
        }
    }

    /// Run `call` with retries
    ///
    /// A retryable failure on the last allowed attempt becomes
    /// [`MoatError::RetryExhausted`]; a non-retryable failure is returned as is.
    pub fn execute<T, F>(&self, mut call: F) -> Result<T, MoatError>
    where
        F: FnMut(&RetryContext) -> Result<T, MoatError>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut ctx = RetryContext::default();
        loop {
            if ctx.attempts > 0 {
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                let delay = self.backoff(ctx.attempts);
                tracing::debug!(
                    resource = %self.resource,
                    attempt = ctx.attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying call"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
            ctx.attempts += 1;

            let err = match call(&ctx) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.predicate_allows(&err) {
                return Err(err);
            }
            ctx.last = Some(err);
            if !self.can_retry(&ctx) {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                let last = ctx.last.take().unwrap_or(MoatError::AlreadyEnded);
                return Err(MoatError::RetryExhausted {
                    attempts: ctx.attempts,
                    last: Box::new(last),
                });
            }
        }
    }

    /// Attempts remain and the latest failure is retryable
    pub fn can_retry(&self, ctx: &RetryContext) -> bool {
        ctx.attempts < self.config.load().max_attempts
            && ctx.last.as_ref().is_some_and(|err| self.predicate_allows(err))
    }

    /// Whether a failure may be retried, ignoring the attempt budget
    pub fn predicate_allows(&self, err: &MoatError) -> bool {
        if matches!(err, MoatError::AlreadyEnded) {
            return false;
        }
        let config = self.config.load();
        let class = self.registry.classify_moat(err).unwrap_or(ErrorClass::ROOT);
        if let Some(verdict) = self.verdict(&class, &config) {
            return verdict;
        }

        let mut cause = match err {
            MoatError::Business(inner) => inner.source(),
            other => other.source(),
        };
        for _ in 0..config.max_cause_depth {
            let Some(current) = cause else {
                break;
            };
            if let Some(class) = self.registry.classify(current)
                && let Some(verdict) = self.verdict(&class, &config)
            {
                return verdict;
            }
            cause = current.source();
        }
        config.retry_unknown
    }

    fn verdict(&self, class: &ErrorClass, config: &RetryConfig) -> Option<bool> {
        if let Some(known) = self.verdicts.get(class) {
            return *known;
        }
        let verdict = class.ancestors().find_map(|ancestor| {
            if config.exclude.contains(&ancestor) {
                Some(false)
            } else if config.include.contains(&ancestor) {
                Some(true)
            } else {
                None
            }
        });
        self.verdicts.insert(class.clone(), verdict);
        verdict
    }

    /// Wait before attempt `attempts + 1`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let config = self.config.load();
        if config.delay.is_zero() || attempts == 0 {
            return Duration::ZERO;
        }
        let base_ms = u64::try_from(config.delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(config.max_delay.as_millis()).unwrap_or(u64::MAX);
        let policy = chrono_machines::Policy {
            max_attempts: u8::MAX as _,
            base_delay_ms: base_ms,
            multiplier: config.multiplier as _,
            max_delay_ms: max_ms.max(base_ms),
        };
        let attempt = attempts.min(u8::MAX as u32);
        Duration::from_millis(policy.calculate_delay(attempt as _, config.jitter_factor) as u64)
    }

    /// Number of memoized class verdicts
    pub fn cached_verdicts(&self) -> usize {
        self.verdicts.len()
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}
