//! Request handles: one admitted-or-rejected invocation attempt
//!
//! A handle is completed exactly once. Completion is a single
//! compare-and-set on a tri-state flag (`PENDING -> ENDING -> ENDED`); only
//! the caller that wins it unwinds the held moats, reports the outcome and
//! notifies listeners. Every other completion attempt, concurrent or later,
//! gets [`MoatError::AlreadyEnded`].

use crate::classifier::FailureContext;
use crate::errors::{MoatError, NotPermitted};
use crate::moat::{Moat, Ticket};
use crate::resource::ResourceId;
use parking_lot::Mutex;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const ENDING: u8 = 1;
const ENDED: u8 = 2;

/// How a call ended
#[derive(Clone, Copy)]
pub enum Outcome<'a> {
    Success,
    Result(&'a dyn Any),
    Error(&'a (dyn Error + 'static)),
}

impl Outcome<'_> {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

impl fmt::Debug for Outcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("Success"),
            Outcome::Result(_) => f.write_str("Result(..)"),
            Outcome::Error(err) => f.debug_tuple("Error").field(&err.to_string()).finish(),
        }
    }
}

/// Observer of completed invocations
pub trait InvocationListener: Send + Sync {
    fn on_end(&self, resource: &ResourceId, outcome: &Outcome<'_>, elapsed: Duration);
}

impl<F> InvocationListener for F
where
    F: Fn(&ResourceId, &Outcome<'_>, Duration) + Send + Sync,
{
    fn on_end(&self, resource: &ResourceId, outcome: &Outcome<'_>, elapsed: Duration) {
        self(resource, outcome, elapsed)
    }
}

pub type SharedListeners = Arc<[Arc<dyn InvocationListener>]>;

/// Moats a call was admitted by, with their tickets
pub(crate) type Entered = Vec<(Arc<Moat>, Ticket)>;

/// One invocation attempt, completed exactly once
pub struct RequestHandle<T = ()> {
    resource: ResourceId,
    state: AtomicU8,
    entered: Mutex<Entered>,
    rejection: Option<NotPermitted>,
    fallback: Mutex<Option<Result<T, MoatError>>>,
    started: Instant,
    listeners: SharedListeners,
}

impl<T> RequestHandle<T> {
    pub(crate) fn admitted(resource: ResourceId, entered: Entered, listeners: SharedListeners) -> Self {
        Self {
            resource,
            state: AtomicU8::new(PENDING),
            entered: Mutex::new(entered),
            rejection: None,
            fallback: Mutex::new(None),
            started: Instant::now(),
            listeners,
        }
    }

    /// A handle born ended, carrying the rejection and any precomputed fallback
    pub(crate) fn rejected(
        resource: ResourceId,
        rejection: NotPermitted,
        fallback: Option<Result<T, MoatError>>,
        listeners: SharedListeners,
    ) -> Self {
        Self {
            resource,
            state: AtomicU8::new(ENDED),
            entered: Mutex::new(Vec::new()),
            rejection: Some(rejection),
            fallback: Mutex::new(fallback),
            started: Instant::now(),
            listeners,
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn is_permitted(&self) -> bool {
        self.rejection.is_none()
    }

    pub fn is_ended(&self) -> bool {
        self.state.load(Ordering::Acquire) == ENDED
    }

    /// Why the call was rejected
    pub fn rejection(&self) -> Option<&NotPermitted> {
        self.rejection.as_ref()
    }

    /// Take the fallback result computed at rejection, if one was configured
    pub fn take_fallback(&self) -> Option<Result<T, MoatError>> {
        self.fallback.lock().take()
    }

    pub fn end_with_success(&self) -> Result<(), MoatError> {
        self.end(Outcome::Success)
    }

    /// Complete with the call's value; the breaker classifier may inspect it
    pub fn end_with_result(&self, value: &dyn Any) -> Result<(), MoatError> {
        self.end(Outcome::Result(value))
    }

    pub fn end_with_error(&self, error: &(dyn Error + 'static)) -> Result<(), MoatError> {
        self.end(Outcome::Error(error))
    }

    fn end(&self, outcome: Outcome<'_>) -> Result<(), MoatError> {
        if self
            .state
            .compare_exchange(PENDING, ENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MoatError::AlreadyEnded);
        }

        let elapsed = self.started.elapsed();
        let entered = std::mem::take(&mut *self.entered.lock());
        let name = self.resource.to_string();
        let ctx = FailureContext {
            circuit_name: &name,
            error: match outcome {
                Outcome::Error(err) => Some(err),
                _ => None,
            },
            result: match outcome {
                Outcome::Result(value) => Some(value),
                _ => None,
            },
            duration: elapsed,
        };
        for (moat, ticket) in entered {
            moat.on_exit(ticket, &ctx);
        }
        self.state.store(ENDED, Ordering::Release);

        for listener in self.listeners.iter() {
            let notified = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_end(&self.resource, &outcome, elapsed)
            }));
            if notified.is_err() {
                tracing::warn!(resource = %self.resource, "invocation listener panicked");
            }
        }
        Ok(())
    }
}

impl<T> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            ENDING => "ending",
            _ => "ended",
        };
        f.debug_struct("RequestHandle")
            .field("resource", &self.resource)
            .field("state", &state)
            .field("rejection", &self.rejection)
            .finish()
    }
}
