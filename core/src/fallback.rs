//! Fallback dispatch
//!
//! A [`Fallback`] turns a rejection (and optionally a business failure) into
//! a substitute outcome: a fixed value, a fixed error, or the result of the
//! best matching handler from a registration table.
//!
//! Handlers declare the error class they accept. Dispatch picks the handler
//! whose declared class is the nearest ancestor of the cause's class; among
//! handlers declared for the same class, one taking the cause and the call
//! arguments beats one taking the cause only, which beats one taking the
//! arguments only, which beats one taking nothing. Selections for the
//! built-in rejection kinds are computed once when the table is built; other
//! classes are resolved on first use and remembered.

use crate::class::{ClassRegistry, ErrorClass};
use crate::errors::{BoxError, MoatError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

type ValueFn<T> = Arc<dyn Fn() -> T + Send + Sync>;
type ErrorFn = Arc<dyn Fn() -> BoxError + Send + Sync>;

/// Handler shapes, strongest first
pub enum Handler<A, T> {
    CauseArgs(Arc<dyn Fn(&MoatError, &A) -> Result<T, BoxError> + Send + Sync>),
    Cause(Arc<dyn Fn(&MoatError) -> Result<T, BoxError> + Send + Sync>),
    Args(Arc<dyn Fn(&A) -> Result<T, BoxError> + Send + Sync>),
    Nothing(Arc<dyn Fn() -> Result<T, BoxError> + Send + Sync>),
}

impl<A, T> Handler<A, T> {
    fn rank(&self) -> u8 {
        match self {
            Handler::CauseArgs(_) => 3,
            Handler::Cause(_) => 2,
            Handler::Args(_) => 1,
            Handler::Nothing(_) => 0,
        }
    }

    fn call(&self, cause: &MoatError, args: &A) -> Result<T, BoxError> {
        match self {
            Handler::CauseArgs(f) => f(cause, args),
            Handler::Cause(f) => f(cause),
            Handler::Args(f) => f(args),
            Handler::Nothing(f) => f(),
        }
    }
}

struct Entry<A, T> {
    class: ErrorClass,
    handler: Handler<A, T>,
}

/// Causes whose handler is chosen when the table is built
const PRECOMPUTED: [ErrorClass; 7] = [
    ErrorClass::CIRCUIT_BREAKER,
    ErrorClass::RATE_LIMIT,
    ErrorClass::CONCURRENT_LIMIT,
    ErrorClass::NOT_PERMITTED,
    ErrorClass::RETRY_EXHAUSTED,
    ErrorClass::MOAT,
    ErrorClass::ROOT,
];

/// Registration table of fallback handlers
pub struct FallbackTable<A, T> {
    entries: Vec<Entry<A, T>>,
    precomputed: HashMap<ErrorClass, Option<usize>>,
    resolved: DashMap<ErrorClass, Option<usize>>,
}

impl<A, T> FallbackTable<A, T> {
    /// Index of the best handler for `class`
    fn select(&self, class: &ErrorClass) -> Option<usize> {
        if let Some(found) = self.precomputed.get(class) {
            return *found;
        }
        if let Some(found) = self.resolved.get(class) {
            return *found;
        }
        let found = best_match(&self.entries, class);
        self.resolved.insert(class.clone(), found);
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deepest declared ancestor wins, then handler shape, then registration order
fn best_match<A, T>(entries: &[Entry<A, T>], class: &ErrorClass) -> Option<usize> {
    let mut best: Option<(usize, usize, u8)> = None;
    for (index, entry) in entries.iter().enumerate() {
        if !class.is_a(&entry.class) {
            continue;
        }
        let key = (entry.class.depth(), entry.handler.rank());
        match best {
            Some((_, depth, rank)) if (depth, rank) >= key => {}
            _ => best = Some((index, key.0, key.1)),
        }
    }
    best.map(|(index, _, _)| index)
}

/// Builder for a handler table
pub struct FallbackTableBuilder<A, T> {
    entries: Vec<Entry<A, T>>,
}

impl<A, T> FallbackTableBuilder<A, T> {
    /// Handle causes of `class` (and subclasses) with the cause and call arguments
    pub fn on_cause_with_args<F>(mut self, class: impl Into<ErrorClass>, f: F) -> Self
    where
        F: Fn(&MoatError, &A) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            class: class.into(),
            handler: Handler::CauseArgs(Arc::new(f)),
        });
        self
    }

    /// Handle causes of `class` (and subclasses) with the cause only
    pub fn on_cause<F>(mut self, class: impl Into<ErrorClass>, f: F) -> Self
    where
        F: Fn(&MoatError) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            class: class.into(),
            handler: Handler::Cause(Arc::new(f)),
        });
        self
    }

    /// Catch-all taking the call arguments
    pub fn on_args<F>(mut self, f: F) -> Self
    where
        F: Fn(&A) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            class: ErrorClass::ROOT,
            handler: Handler::Args(Arc::new(f)),
        });
        self
    }

    /// Catch-all taking nothing
    pub fn otherwise<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            class: ErrorClass::ROOT,
            handler: Handler::Nothing(Arc::new(f)),
        });
        self
    }

    pub fn build(self) -> Fallback<A, T> {
        let precomputed = PRECOMPUTED
            .iter()
            .map(|class| (class.clone(), best_match(&self.entries, class)))
            .collect();
        Fallback {
            kind: FallbackKind::Function(FallbackTable {
                entries: self.entries,
                precomputed,
                resolved: DashMap::new(),
            }),
            apply_to_business: false,
        }
    }
}

enum FallbackKind<A, T> {
    Value(ValueFn<T>),
    Error(ErrorFn),
    Function(FallbackTable<A, T>),
}

/// Substitute outcome for rejected (or failed) calls of signature `(A) -> T`
pub struct Fallback<A, T> {
    kind: FallbackKind<A, T>,
    apply_to_business: bool,
}

impl<A, T> Fallback<A, T> {
    /// Always answer with `value`
    pub fn to_value(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            kind: FallbackKind::Value(Arc::new(move || value.clone())),
            apply_to_business: false,
        }
    }

    /// Always fail with the error `f` produces
    pub fn to_error<F>(f: F) -> Self
    where
        F: Fn() -> BoxError + Send + Sync + 'static,
    {
        Self {
            kind: FallbackKind::Error(Arc::new(f)),
            apply_to_business: false,
        }
    }

    /// Dispatch to registered handlers
    pub fn to_function() -> FallbackTableBuilder<A, T> {
        FallbackTableBuilder {
            entries: Vec::new(),
        }
    }

    /// Also apply to business errors, not only to rejections
    pub fn apply_to_business(mut self, enabled: bool) -> Self {
        self.apply_to_business = enabled;
        self
    }

    pub fn applies_to_business(&self) -> bool {
        self.apply_to_business
    }

    /// True when this fallback handles `cause`
    pub fn handles(&self, cause: &MoatError) -> bool {
        match cause {
            MoatError::AlreadyEnded | MoatError::FallbackFailed { .. } => false,
            cause if business_rooted(cause) => self.apply_to_business,
            _ => true,
        }
    }

    /// Turn `cause` into the substitute outcome
    ///
    /// Causes this fallback does not handle, and causes no handler matches,
    /// come back unchanged. A failing handler yields
    /// [`MoatError::FallbackFailed`].
    pub fn apply(&self, cause: MoatError, args: &A, registry: &ClassRegistry) -> Result<T, MoatError> {
        if !self.handles(&cause) {
            return Err(cause);
        }
        match &self.kind {
            FallbackKind::Value(value) => Ok(value()),
            FallbackKind::Error(error) => Err(MoatError::Business(error())),
            FallbackKind::Function(table) => {
                let class = registry.classify_moat(&cause).unwrap_or(ErrorClass::ROOT);
                let Some(index) = table.select(&class) else {
                    return Err(cause);
                };
                table.entries[index]
                    .handler
                    .call(&cause, args)
                    .map_err(|source| {
                        tracing::debug!(%class, error = %source, "fallback handler failed");
                        MoatError::FallbackFailed {
                            cause: Box::new(cause),
                            source,
                        }
                    })
            }
        }
    }
}

/// Business failures, including ones that ran out of retries
fn business_rooted(cause: &MoatError) -> bool {
    match cause {
        MoatError::Business(_) => true,
        MoatError::RetryExhausted { last, .. } => business_rooted(last),
        _ => false,
    }
}

impl<A, T> std::fmt::Debug for Fallback<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            FallbackKind::Value(_) => "value".to_string(),
            FallbackKind::Error(_) => "error".to_string(),
            FallbackKind::Function(table) => format!("function({} handlers)", table.len()),
        };
        f.debug_struct("Fallback")
            .field("kind", &kind)
            .field("apply_to_business", &self.apply_to_business)
            .finish()
    }
}
