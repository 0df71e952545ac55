//! Failure classification for circuit breaker outcomes
//!
//! A classifier decides whether a completed call counts as a failure in the
//! breaker's ring. It sees the call's error (if any), its result value (for
//! `end_with_result`), and how long the call took.

use crate::class::{ClassRegistry, ErrorClass};
use crate::config::CircuitBreakerConfig;
use std::any::Any;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Context provided to failure classifiers for outcome evaluation
#[derive(Clone, Copy)]
pub struct FailureContext<'a> {
    /// Breaker name
    pub circuit_name: &'a str,
    /// The error the call ended with
    pub error: Option<&'a (dyn Error + 'static)>,
    /// The value the call ended with (can be downcast to specific types)
    pub result: Option<&'a dyn Any>,
    /// How long the call took
    pub duration: Duration,
}

impl<'a> FailureContext<'a> {
    pub fn success(circuit_name: &'a str, duration: Duration) -> Self {
        Self {
            circuit_name,
            error: None,
            result: None,
            duration,
        }
    }

    pub fn failure(
        circuit_name: &'a str,
        error: &'a (dyn Error + 'static),
        duration: Duration,
    ) -> Self {
        Self {
            circuit_name,
            error: Some(error),
            result: None,
            duration,
        }
    }
}

impl std::fmt::Debug for FailureContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureContext")
            .field("circuit_name", &self.circuit_name)
            .field("error", &self.error.map(|e| e.to_string()))
            .field("result", &self.result.is_some())
            .field("duration", &self.duration)
            .finish()
    }
}

/// Trait for classifying outcomes - determines if a call should count as a failure
///
/// # Examples
///
/// ```rust
/// use moat_machines::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct EmptyResultClassifier;
///
/// impl FailureClassifier for EmptyResultClassifier {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error.is_some()
///             || ctx
///                 .result
///                 .and_then(|r| r.downcast_ref::<Vec<u8>>())
///                 .is_some_and(|body| body.is_empty())
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the outcome should be recorded as a failure
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier: every error is a failure, every value a success
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        ctx.error.is_some()
    }
}

/// Error-based classifier that ignores configured error classes
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    ignore: Vec<ErrorClass>,
    registry: ClassRegistry,
}

impl ErrorClassifier {
    pub fn new(ignore: Vec<ErrorClass>, registry: ClassRegistry) -> Self {
        Self { ignore, registry }
    }
}

impl FailureClassifier for ErrorClassifier {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        let Some(error) = ctx.error else {
            return false;
        };
        match self.registry.classify(error) {
            Some(class) => !self.ignore.iter().any(|ignored| class.is_a(ignored)),
            // Unclassified errors always count
            None => true,
        }
    }
}

/// Duration-based classifier: calls slower than the limit are failures
#[derive(Debug, Clone, Copy)]
pub struct SlowCallClassifier {
    max_spend_time: Duration,
}

impl SlowCallClassifier {
    pub fn new(max_spend_time: Duration) -> Self {
        Self { max_spend_time }
    }
}

impl FailureClassifier for SlowCallClassifier {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        ctx.duration > self.max_spend_time
    }
}

/// Duration check first, then the error-based classifier
#[derive(Debug, Clone)]
pub struct CombinedClassifier {
    slow: SlowCallClassifier,
    errors: Arc<dyn FailureClassifier>,
}

impl CombinedClassifier {
    pub fn new(slow: SlowCallClassifier, errors: Arc<dyn FailureClassifier>) -> Self {
        Self { slow, errors }
    }
}

impl FailureClassifier for CombinedClassifier {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        self.slow.should_trip(ctx) || self.errors.should_trip(ctx)
    }
}

/// Predicate-based classifier using a closure
///
/// Allows using simple closures for common filtering patterns.
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

/// Classifier implied by a breaker config
///
/// `custom` replaces the error-based part; `max_spend_time` always wraps it
/// with a duration check evaluated first.
pub fn from_config(
    config: &CircuitBreakerConfig,
    registry: &ClassRegistry,
    custom: Option<&Arc<dyn FailureClassifier>>,
) -> Arc<dyn FailureClassifier> {
    let errors: Arc<dyn FailureClassifier> = match custom {
        Some(custom) => Arc::clone(custom),
        None if config.ignore_classes.is_empty() => Arc::new(DefaultClassifier),
        None => Arc::new(ErrorClassifier::new(
            config.ignore_classes.clone(),
            registry.clone(),
        )),
    };
    match config.max_spend_time {
        Some(limit) => Arc::new(CombinedClassifier::new(
            SlowCallClassifier::new(limit),
            errors,
        )),
        None => errors,
    }
}
