//! Hierarchical error classes
//!
//! Retry tables, circuit-breaker ignore lists and fallback handlers all
//! select errors by class. A class is a dotted path such as
//! `biz.timeout.read`; its parent is the path with the last segment
//! removed (`biz.timeout`), and the empty root class is the parent of every
//! top-level class. Looking up "the nearest listed superclass" is therefore
//! a walk over [`ErrorClass::ancestors`].
//!
//! Errors get a class through a [`ClassRegistry`]. Library errors
//! ([`MoatError`], [`ServiceError`]) classify themselves; other error types
//! are mapped with [`ClassRegistry::register`], which downcasts the error
//! the same way failure classifiers inspect `&dyn Any`.

use crate::errors::{MoatError, ServiceError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Dotted, hierarchical error class name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorClass(Cow<'static, str>);

impl ErrorClass {
    /// Root of the hierarchy, matches every class
    pub const ROOT: ErrorClass = ErrorClass::from_static("");
    /// Any error raised by the moat machinery itself
    pub const MOAT: ErrorClass = ErrorClass::from_static("moat");
    /// Any admission rejection
    pub const NOT_PERMITTED: ErrorClass = ErrorClass::from_static("moat.not_permitted");
    pub const RATE_LIMIT: ErrorClass = ErrorClass::from_static("moat.not_permitted.rate_limit");
    pub const CONCURRENT_LIMIT: ErrorClass =
        ErrorClass::from_static("moat.not_permitted.concurrent_limit");
    pub const CIRCUIT_BREAKER: ErrorClass =
        ErrorClass::from_static("moat.not_permitted.circuit_breaker");
    pub const RETRY_EXHAUSTED: ErrorClass = ErrorClass::from_static("moat.retry_exhausted");
    pub const FALLBACK_FAILED: ErrorClass = ErrorClass::from_static("moat.fallback_failed");
    pub const ALREADY_ENDED: ErrorClass = ErrorClass::from_static("moat.already_ended");

    pub const fn from_static(path: &'static str) -> Self {
        ErrorClass(Cow::Borrowed(path))
    }

    pub fn new(path: impl Into<String>) -> Self {
        ErrorClass(Cow::Owned(path.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments; the root has depth 0
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.split('.').count()
        }
    }

    /// Direct superclass, `None` for the root
    pub fn parent(&self) -> Option<ErrorClass> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('.') {
            Some(pos) => Some(ErrorClass::new(&self.0[..pos])),
            None => Some(ErrorClass::ROOT),
        }
    }

    /// This class followed by each superclass, ending with the root
    pub fn ancestors(&self) -> impl Iterator<Item = ErrorClass> {
        std::iter::successors(Some(self.clone()), |class| class.parent())
    }

    /// True when `self` equals `other` or descends from it
    pub fn is_a(&self, other: &ErrorClass) -> bool {
        other.is_root()
            || self.0 == other.0
            || (self.0.starts_with(other.as_str())
                && self.0.as_bytes().get(other.0.len()) == Some(&b'.'))
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&'static str> for ErrorClass {
    fn from(path: &'static str) -> Self {
        ErrorClass::from_static(path)
    }
}

type ClassFn = Arc<dyn Fn(&(dyn Error + 'static)) -> Option<ErrorClass> + Send + Sync>;

/// Maps error values to their [`ErrorClass`]
#[derive(Clone, Default)]
pub struct ClassRegistry {
    mappers: Vec<ClassFn>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify every error of type `E` as `class`
    pub fn register<E>(mut self, class: impl Into<ErrorClass>) -> Self
    where
        E: Error + 'static,
    {
        let class = class.into();
        self.mappers.push(Arc::new(move |err| {
            err.downcast_ref::<E>().map(|_| class.clone())
        }));
        self
    }

    /// Classify with a custom function; return `None` to defer to later mappers
    pub fn register_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> Option<ErrorClass> + Send + Sync + 'static,
    {
        self.mappers.push(Arc::new(f));
        self
    }

    /// Class of a single error value, without looking at its causes
    pub fn classify(&self, err: &(dyn Error + 'static)) -> Option<ErrorClass> {
        if let Some(moat) = err.downcast_ref::<MoatError>() {
            return match moat {
                MoatError::Business(inner) => self.classify(inner.as_ref()),
                other => Some(other.class()),
            };
        }
        if let Some(service) = err.downcast_ref::<ServiceError>() {
            return Some(service.class().clone());
        }
        self.mappers.iter().find_map(|mapper| mapper(err))
    }

    /// Class of a [`MoatError`], classifying business errors through the registry
    pub fn classify_moat(&self, err: &MoatError) -> Option<ErrorClass> {
        match err {
            MoatError::Business(inner) => self.classify(inner.as_ref()),
            other => Some(other.class()),
        }
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("mappers", &self.mappers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;

    #[test]
    fn test_parent_chain_ends_at_root() {
        let class = ErrorClass::new("biz.timeout.read");
        let chain: Vec<String> = class.ancestors().map(|c| c.as_str().to_string()).collect();

        assert_eq!(chain, vec!["biz.timeout.read", "biz.timeout", "biz", ""]);
        assert_eq!(class.depth(), 3);
        assert_eq!(ErrorClass::ROOT.parent(), None);
    }

    #[test]
    fn test_is_a_respects_segment_boundaries() {
        let read = ErrorClass::new("biz.timeout.read");

        assert!(read.is_a(&ErrorClass::new("biz.timeout")));
        assert!(read.is_a(&ErrorClass::ROOT));
        assert!(read.is_a(&read));
        assert!(!read.is_a(&ErrorClass::new("biz.time")));
        assert!(!ErrorClass::new("biz").is_a(&read));
    }

    #[test]
    fn test_registry_classifies_by_type() {
        let registry = ClassRegistry::new().register::<std::fmt::Error>("biz.format");
        let err: BoxError = Box::new(std::fmt::Error);

        assert_eq!(
            registry.classify(err.as_ref()),
            Some(ErrorClass::new("biz.format"))
        );

        let other: BoxError = "plain".into();
        assert_eq!(registry.classify(other.as_ref()), None);
    }

    #[test]
    fn test_service_error_carries_its_class() {
        let registry = ClassRegistry::new();
        let err = MoatError::Business(Box::new(ServiceError::new("biz.db", "down")));

        assert_eq!(registry.classify_moat(&err), Some(ErrorClass::new("biz.db")));
    }
}
