//! Circuit breaker implementation using state machines
//!
//! Transitions are driven by a `state_machines` dynamic machine, which is the
//! single authority on which moves are legal. Callers never touch the machine
//! on the hot path: admission and outcome recording work on an immutable
//! state snapshot published through an `ArcSwap`. Each snapshot owns the ring
//! of outcomes for the state it represents, so a call admitted under one
//! state records into that state's ring even if a transition happened while
//! it was running.
//!
//! A transition only succeeds when the snapshot the caller observed is still
//! the published one. Of two racing callers that both see a full ring over
//! the threshold, exactly one moves the breaker.

use crate::callbacks::{Callbacks, StateTransition};
use crate::class::ClassRegistry;
use crate::classifier::{self, FailureClassifier, FailureContext};
use crate::config::{CircuitBreakerConfig, ForcedState};
use crate::metrics::CircuitBreakerMetrics;
use crate::ring_bits::RingBitSet;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use machine::{CircuitEvent, DynamicCircuit};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    ForcedOpen,
    Disabled,
}

impl CircuitState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            "ForcedOpen" => CircuitState::ForcedOpen,
            "Disabled" => CircuitState::Disabled,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
            CircuitState::ForcedOpen => "forced_open",
            CircuitState::Disabled => "disabled",
        }
    }

    /// States whose rings take part in rate evaluation
    fn records(self) -> bool {
        matches!(self, CircuitState::Closed | CircuitState::HalfOpen)
    }

    fn permits(self) -> bool {
        matches!(
            self,
            CircuitState::Closed | CircuitState::HalfOpen | CircuitState::Disabled
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context shared by the transition machine
#[derive(Debug, Clone, Default)]
pub struct MachineContext {
    pub name: String,
}

mod machine {
    use super::MachineContext;
    use state_machines::state_machine;

    state_machine! {
        name: Circuit,
        context: MachineContext,
        dynamic: true,

        initial: Closed,
        states: [Closed, Open, HalfOpen, ForcedOpen, Disabled],
        events {
            trip {
                transition: { from: [Closed, HalfOpen], to: Open }
            }
            attempt_reset {
                transition: { from: Open, to: HalfOpen }
            }
            close {
                transition: { from: HalfOpen, to: Closed }
            }
            force_open {
                transition: { from: [Closed, Open, HalfOpen, Disabled], to: ForcedOpen }
            }
            disable {
                transition: { from: [Closed, Open, HalfOpen, ForcedOpen], to: Disabled }
            }
        }
    }
}

/// One published breaker state with its outcome ring
#[derive(Debug)]
struct Snapshot {
    state: CircuitState,
    ring: Mutex<RingBitSet>,
    entered_at: Instant,
    /// Time to stay open (jittered), zero for other states
    wait: Duration,
    not_permitted: AtomicU64,
}

impl Snapshot {
    fn new(
        state: CircuitState,
        config: &CircuitBreakerConfig,
        previous: Option<&Snapshot>,
    ) -> Self {
        let closed_size = config.ring_buffer_size_in_closed_state;
        let ring = match (state, previous) {
            (CircuitState::HalfOpen, _) => {
                RingBitSet::new(config.ring_buffer_size_in_half_open_state)
            }
            // Open keeps the history that tripped it
            (CircuitState::Open, Some(previous)) => {
                RingBitSet::from_previous(closed_size, &previous.ring.lock())
            }
            _ => RingBitSet::new(closed_size),
        };
        let wait = if state == CircuitState::Open {
            open_wait(config)
        } else {
            Duration::ZERO
        };
        Self {
            state,
            ring: Mutex::new(ring),
            entered_at: Instant::now(),
            wait,
            not_permitted: AtomicU64::new(0),
        }
    }

    fn reject(&self) {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Open-state wait, shortened by the configured jitter
fn open_wait(config: &CircuitBreakerConfig) -> Duration {
    if config.jitter_factor <= 0.0 {
        return config.wait_duration_in_open_state;
    }
    let wait_ms =
        u64::try_from(config.wait_duration_in_open_state.as_millis()).unwrap_or(u64::MAX);
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: wait_ms,
        multiplier: 1.0,
        max_delay_ms: wait_ms,
    };
    Duration::from_millis(policy.calculate_delay(1, config.jitter_factor) as u64)
}

/// Admission granted by a breaker; outcomes are recorded against the
/// state it was granted in
#[derive(Debug, Clone)]
pub struct BreakerTicket {
    snapshot: Arc<Snapshot>,
}

impl BreakerTicket {
    /// State the call was admitted in
    pub fn state(&self) -> CircuitState {
        self.snapshot.state
    }
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    name: String,
    config: ArcSwap<CircuitBreakerConfig>,
    classifier: ArcSwap<Arc<dyn FailureClassifier>>,
    custom_classifier: Option<Arc<dyn FailureClassifier>>,
    registry: ClassRegistry,
    state: ArcSwap<Snapshot>,
    machine: Mutex<DynamicCircuit>,
    callbacks: Callbacks,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_parts(name, config, ClassRegistry::new(), None, Callbacks::new())
    }

    /// Create a breaker with its classification and listeners
    ///
    /// `custom_classifier` replaces the error-based part of the classifier
    /// built from `config`.
    pub fn with_parts(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        registry: ClassRegistry,
        custom_classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        let name = name.into();
        let mut machine = DynamicCircuit::new(MachineContext { name: name.clone() });
        apply_forced_state(&mut machine, config.forced_state);
        let state = CircuitState::from_machine(machine.current_state());
        let classifier = classifier::from_config(&config, &registry, custom_classifier.as_ref());

        Self {
            state: ArcSwap::from_pointee(Snapshot::new(state, &config, None)),
            classifier: ArcSwap::from_pointee(classifier),
            config: ArcSwap::from_pointee(config),
            custom_classifier,
            registry,
            machine: Mutex::new(machine),
            callbacks,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Arc<CircuitBreakerConfig> {
        self.config.load_full()
    }

    pub fn state(&self) -> CircuitState {
        self.state.load().state
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), CircuitState::Open | CircuitState::ForcedOpen)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Ask for permission to run a call
    ///
    /// While open, the first caller to arrive after the wait moves the breaker
    /// to half-open and is admitted as a probe. Callers crossing the boundary
    /// at the same moment are all admitted and record into the half-open ring.
    pub fn try_acquire(&self) -> Option<BreakerTicket> {
        let current = self.state.load_full();
        match current.state {
            state if state.permits() => Some(BreakerTicket { snapshot: current }),
            CircuitState::Open if current.entered_at.elapsed() >= current.wait => {
                self.transition(Some(&current), CircuitEvent::AttemptReset);
                let next = self.state.load_full();
                if next.state.permits() {
                    Some(BreakerTicket { snapshot: next })
                } else {
                    next.reject();
                    None
                }
            }
            _ => {
                current.reject();
                None
            }
        }
    }

    /// Record a finished call, classifying it first
    pub fn on_complete(&self, ticket: &BreakerTicket, ctx: &FailureContext<'_>) {
        let failure = self.classifier.load().should_trip(ctx);
        self.record(ticket, failure);
    }

    /// Record a call the caller already knows succeeded
    pub fn on_success(&self, ticket: &BreakerTicket) {
        self.record(ticket, false);
    }

    /// Record a call the caller already knows failed
    pub fn on_error(&self, ticket: &BreakerTicket) {
        self.record(ticket, true);
    }

    fn record(&self, ticket: &BreakerTicket, failure: bool) {
        let snapshot = &ticket.snapshot;
        if !snapshot.state.records() {
            return;
        }
        let rate = {
            let mut ring = snapshot.ring.lock();
            ring.set_next_bit(failure);
            ring.failure_rate()
        };
        if rate < 0.0 {
            return;
        }

        if rate >= self.config.load().failure_rate_threshold {
            self.transition(Some(snapshot), CircuitEvent::Trip);
        } else if snapshot.state == CircuitState::HalfOpen {
            self.transition(Some(snapshot), CircuitEvent::Close);
        }
    }

    /// Pin the breaker open until reset or reconfigured
    pub fn force_open(&self) -> bool {
        self.transition(None, CircuitEvent::ForceOpen)
    }

    /// Permit every call and record nothing until reset or reconfigured
    pub fn disable(&self) -> bool {
        self.transition(None, CircuitEvent::Disable)
    }

    /// Restart in the state the current config implies, with fresh rings
    pub fn reset(&self) {
        let mut machine = self.machine.lock();
        let previous = self.state.load_full();
        let config = self.config.load_full();

        *machine = DynamicCircuit::new(MachineContext {
            name: self.name.clone(),
        });
        apply_forced_state(&mut machine, config.forced_state);
        let to = CircuitState::from_machine(machine.current_state());
        self.state.store(Arc::new(Snapshot::new(to, &config, None)));
        drop(machine);

        if previous.state != to {
            self.announce(previous.state, to);
        }
    }

    /// Replace the working configuration
    ///
    /// Threshold and classification changes apply in place. Ring sizes, the
    /// open wait or a forced state restart the breaker.
    pub fn change_config(&self, config: CircuitBreakerConfig) {
        let previous = self.config.load_full();
        let restart = previous.restarts_state(&config);

        self.classifier.store(Arc::new(classifier::from_config(
            &config,
            &self.registry,
            self.custom_classifier.as_ref(),
        )));
        self.config.store(Arc::new(config));

        tracing::debug!(circuit = %self.name, restart, "circuit breaker config changed");
        if restart {
            self.reset();
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let snapshot = self.state.load();
        let ring = snapshot.ring.lock();
        CircuitBreakerMetrics {
            state: snapshot.state,
            failure_rate: ring.failure_rate(),
            buffered_calls: ring.length(),
            failed_calls: ring.cardinality(),
            max_buffered_calls: ring.size(),
            not_permitted_calls: snapshot.not_permitted.load(Ordering::Relaxed),
        }
    }

    /// Fire `event` on the machine and publish the resulting state
    ///
    /// With `expected`, the move only happens while that snapshot is still
    /// the published one.
    fn transition(&self, expected: Option<&Arc<Snapshot>>, event: CircuitEvent) -> bool {
        let mut machine = self.machine.lock();
        let current = self.state.load_full();
        if let Some(expected) = expected
            && !Arc::ptr_eq(&current, expected)
        {
            return false;
        }
        if machine.handle(event).is_err() {
            return false;
        }

        let to = CircuitState::from_machine(machine.current_state());
        let config = self.config.load();
        self.state
            .store(Arc::new(Snapshot::new(to, &config, Some(&current))));
        drop(machine);

        self.announce(current.state, to);
        true
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        tracing::info!(circuit = %self.name, %from, %to, "circuit breaker state changed");
        self.callbacks.notify(&StateTransition {
            circuit: self.name.clone(),
            from,
            to,
        });
    }
}

fn apply_forced_state(machine: &mut DynamicCircuit, forced: Option<ForcedState>) {
    let event = match forced {
        Some(ForcedState::Open) => CircuitEvent::ForceOpen,
        Some(ForcedState::Disabled) => CircuitEvent::Disable,
        None => return,
    };
    // a fresh machine always accepts both events
    let _ = machine.handle(event);
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config.load())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
