//! Error types for moat operations

use crate::class::ErrorClass;
use crate::metrics::MoatMetrics;
use crate::moat::MoatKind;
use crate::resource::ResourceId;
use std::error::Error;

/// Opaque error raised by protected business code
pub type BoxError = Box<dyn Error + Send + Sync>;

/// An admission-time rejection by one moat
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} rejected call to '{resource}'")]
pub struct NotPermitted {
    /// Resource whose moat rejected the call
    pub resource: ResourceId,
    /// Engine kind of the rejecting moat
    pub kind: MoatKind,
    /// Engine metrics observed at rejection time
    pub metrics: MoatMetrics,
}

impl NotPermitted {
    pub fn class(&self) -> ErrorClass {
        match self.kind {
            MoatKind::RateLimit => ErrorClass::RATE_LIMIT,
            MoatKind::ConcurrentLimit => ErrorClass::CONCURRENT_LIMIT,
            MoatKind::CircuitBreaker => ErrorClass::CIRCUIT_BREAKER,
        }
    }
}

/// Errors surfaced to callers of the execution chain
#[derive(Debug, thiserror::Error)]
pub enum MoatError {
    /// A moat rejected the call before it ran
    #[error(transparent)]
    NotPermitted(#[from] NotPermitted),
    /// Retries ran out; `last` is the cause of the final attempt
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<MoatError>,
    },
    /// The fallback handler itself failed while handling `cause`
    #[error("fallback failed while handling '{cause}': {source}")]
    FallbackFailed {
        cause: Box<MoatError>,
        #[source]
        source: BoxError,
    },
    /// A request handle was completed more than once
    #[error("request handle already ended")]
    AlreadyEnded,
    /// The protected call's own failure
    #[error("{0}")]
    Business(BoxError),
}

impl MoatError {
    /// Wrap a business error
    pub fn business(err: impl Into<BoxError>) -> Self {
        MoatError::Business(err.into())
    }

    /// Built-in class of this error. Business errors are unclassified here
    /// (root class); classify them through a [`crate::ClassRegistry`].
    pub fn class(&self) -> ErrorClass {
        match self {
            MoatError::NotPermitted(np) => np.class(),
            MoatError::RetryExhausted { .. } => ErrorClass::RETRY_EXHAUSTED,
            MoatError::FallbackFailed { .. } => ErrorClass::FALLBACK_FAILED,
            MoatError::AlreadyEnded => ErrorClass::ALREADY_ENDED,
            MoatError::Business(_) => ErrorClass::ROOT,
        }
    }

    pub fn is_not_permitted(&self) -> bool {
        matches!(self, MoatError::NotPermitted(_))
    }

    pub fn is_business(&self) -> bool {
        matches!(self, MoatError::Business(_))
    }

    pub fn not_permitted(&self) -> Option<&NotPermitted> {
        match self {
            MoatError::NotPermitted(np) => Some(np),
            _ => None,
        }
    }

    /// The business error, if this is one
    pub fn as_business(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            MoatError::Business(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// A classed business error
///
/// Business code may return this to take part in class-based retry,
/// ignore and fallback rules without registering its own error types.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
    class: ErrorClass,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ServiceError {
    pub fn new(class: impl Into<ErrorClass>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn class(&self) -> &ErrorClass {
        &self.class
    }
}

/// Malformed configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
    #[error("resource '{0}' cannot carry this configuration")]
    Unsupported(ResourceId),
    #[error("config source failed: {0}")]
    Source(String),
}
