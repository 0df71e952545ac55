//! Callback system for state transitions and cluster events
//!
//! Observers are plain closures registered up front. Events are published to
//! every observer in registration order; a panicking observer is logged and
//! skipped so it can never affect the transition that produced the event.

use crate::circuit::CircuitState;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// A circuit breaker state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// Breaker name (the resource it guards)
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fixed fan-out list of observers for events of type `E`
pub struct Listeners<E> {
    handlers: Vec<Handler<E>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn push<F>(&mut self, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(f));
    }

    /// Builder-style [`push`](Self::push)
    pub fn with<F>(mut self, f: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.push(f);
        self
    }

    /// Append every observer of `other`
    pub fn extend(&mut self, other: &Listeners<E>) {
        self.handlers.extend(other.handlers.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver `event` to every observer, swallowing observer panics
    pub fn notify(&self, event: &E)
    where
        E: std::fmt::Debug,
    {
        for (index, handler) in self.handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(listener = index, event = ?event, "listener panicked");
            }
        }
    }
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Callbacks for circuit breaker transitions
pub type Callbacks = Listeners<StateTransition>;
