//! Atomic cycle-based rate limiter
//!
//! Time is cut into cycles of `limit_refresh_period`. The limiter state
//! (active cycle, remaining permissions, computed wait) lives in a single
//! immutable snapshot that is replaced with compare-and-swap, so readers
//! never block and concurrent acquirers never lose updates. Permissions may
//! go negative: a caller willing to wait reserves a permit from a future
//! cycle and then sleeps until that cycle starts.

use crate::config::RateLimitConfig;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Upper bound for a single wait when the requested one overflows `Instant`
const MAX_PARK: Duration = Duration::from_secs(365 * 24 * 3600);

/// Snapshot of the limiter; never mutated once published
#[derive(Debug, Clone)]
struct State {
    config: Arc<RateLimitConfig>,
    active_cycle: u64,
    active_permissions: i64,
    nanos_to_wait: u64,
}

/// Lock-free rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    /// Monotonic time anchor, cycle 0 starts here
    anchor: Instant,
    state: ArcSwap<State>,
    waiting_threads: AtomicUsize,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let permissions = config.limit_for_period as i64;
        Self {
            name: name.into(),
            anchor: Instant::now(),
            state: ArcSwap::from_pointee(State {
                config: Arc::new(config),
                active_cycle: 0,
                active_permissions: permissions,
                nanos_to_wait: 0,
            }),
            waiting_threads: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current working configuration
    pub fn config(&self) -> Arc<RateLimitConfig> {
        Arc::clone(&self.state.load().config)
    }

    /// Acquire one permit, waiting at most `max_wait`
    ///
    /// Returns `true` once the permit is granted (after sleeping through any
    /// reserved wait). Returns `false` after sleeping `max_wait` when the
    /// permit could not be reserved in time.
    pub fn acquire(&self, max_wait: Duration) -> bool {
        let timeout = duration_nanos(max_wait);
        let next = self.update_state_with_backoff(timeout);
        self.wait_for_permission_if_necessary(timeout, next.nanos_to_wait)
    }

    /// Acquire without waiting
    pub fn try_acquire(&self) -> bool {
        self.acquire(Duration::ZERO)
    }

    /// Replace the working configuration
    ///
    /// Remaining permissions are capped at the new per-cycle limit. A new
    /// refresh period restarts cycle counting at the current instant's cycle.
    pub fn change_config(&self, config: RateLimitConfig) {
        let config = Arc::new(config);
        let now = self.current_nanos();
        self.state.rcu(|current| {
            let period = duration_nanos(config.limit_refresh_period).max(1);
            let cycle = if current.config.limit_refresh_period == config.limit_refresh_period {
                current.active_cycle
            } else {
                now / period
            };
            State {
                config: Arc::clone(&config),
                active_cycle: cycle,
                active_permissions: current
                    .active_permissions
                    .min(config.limit_for_period as i64),
                nanos_to_wait: 0,
            }
        });
    }

    /// Permissions available right now, negative when reservations are queued
    pub fn available_permissions(&self) -> i64 {
        let current = self.state.load_full();
        self.calculate_next_state(None, &current).active_permissions
    }

    /// Threads currently sleeping for a reserved permit
    pub fn waiting_threads(&self) -> usize {
        self.waiting_threads.load(Ordering::Acquire)
    }

    fn current_nanos(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64
    }

    /// Read-compute-CAS loop; retries on contention after yielding
    fn update_state_with_backoff(&self, timeout: u64) -> Arc<State> {
        loop {
            let prev = self.state.load_full();
            let next = Arc::new(self.calculate_next_state(Some(timeout), &prev));
            let witnessed = self.state.compare_and_swap(&prev, Arc::clone(&next));
            if Arc::ptr_eq(&*witnessed, &prev) {
                return next;
            }
            std::thread::yield_now();
        }
    }

    /// Refill for elapsed cycles, compute the wait, and reserve when `timeout`
    /// covers it. `None` only estimates and never reserves.
    fn calculate_next_state(&self, timeout: Option<u64>, active: &State) -> State {
        let config = &active.config;
        let cycle_period = duration_nanos(config.limit_refresh_period).max(1);
        let permissions_per_cycle = config.limit_for_period as i64;

        let current_nanos = self.current_nanos();
        let current_cycle = current_nanos / cycle_period;

        let mut next_cycle = active.active_cycle;
        let mut next_permissions = active.active_permissions;
        if next_cycle < current_cycle {
            let elapsed_cycles = (current_cycle - next_cycle) as i64;
            let accumulated = elapsed_cycles.saturating_mul(permissions_per_cycle);
            next_cycle = current_cycle;
            next_permissions = next_permissions
                .saturating_add(accumulated)
                .min(permissions_per_cycle);
        }

        let nanos_to_wait = nanos_to_wait_for_permission(
            cycle_period,
            permissions_per_cycle,
            next_permissions,
            current_nanos,
            current_cycle,
        );

        let reserve = matches!(timeout, Some(timeout) if timeout >= nanos_to_wait);
        State {
            config: Arc::clone(config),
            active_cycle: next_cycle,
            active_permissions: if reserve {
                next_permissions - 1
            } else {
                next_permissions
            },
            nanos_to_wait,
        }
    }

    fn wait_for_permission_if_necessary(&self, timeout: u64, nanos_to_wait: u64) -> bool {
        if nanos_to_wait == 0 {
            return true;
        }
        if timeout >= nanos_to_wait {
            self.park(nanos_to_wait);
            return true;
        }
        if timeout > 0 {
            self.park(timeout);
        }
        tracing::debug!(
            limiter = %self.name,
            wait_nanos = nanos_to_wait,
            "rate limit permit not available in time"
        );
        false
    }

    /// Sleep until the deadline, tolerating early wake-ups
    fn park(&self, nanos: u64) {
        self.waiting_threads.fetch_add(1, Ordering::AcqRel);
        let start = Instant::now();
        let deadline = start
            .checked_add(Duration::from_nanos(nanos))
            .unwrap_or(start + MAX_PARK);
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::park_timeout(deadline - now);
        }
        self.waiting_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Zero when a permit is available, else time to the next cycle boundary plus
/// the full cycles needed to pay back the reservation deficit
fn nanos_to_wait_for_permission(
    cycle_period: u64,
    permissions_per_cycle: i64,
    available: i64,
    current_nanos: u64,
    current_cycle: u64,
) -> u64 {
    if available > 0 {
        return 0;
    }
    let next_cycle_nanos = (current_cycle + 1) * cycle_period;
    let nanos_to_next_cycle = next_cycle_nanos - current_nanos;
    let full_cycles_to_wait = ((-available) / permissions_per_cycle.max(1)) as u64;
    full_cycles_to_wait * cycle_period + nanos_to_next_cycle
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn limiter(limit: usize, period: Duration) -> RateLimiter {
        RateLimiter::new("test", RateLimitConfig::new(limit, period))
    }

    #[test]
    fn test_grants_limit_then_rejects() {
        let rl = limiter(3, Duration::from_secs(60));

        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(!rl.try_acquire());
        assert_eq!(rl.available_permissions(), 0);
    }

    #[test]
    fn test_refills_after_cycle() {
        let rl = limiter(1, Duration::from_millis(50));

        assert!(rl.try_acquire());
        assert!(!rl.try_acquire());

        thread::sleep(Duration::from_millis(60));
        assert!(rl.try_acquire());
    }

    #[test]
    fn test_refill_is_capped_at_limit() {
        let rl = limiter(2, Duration::from_millis(10));
        thread::sleep(Duration::from_millis(55));

        assert_eq!(rl.available_permissions(), 2);
    }

    #[test]
    fn test_waiting_reserves_future_permit() {
        let rl = limiter(1, Duration::from_millis(50));
        assert!(rl.try_acquire());

        assert!(rl.acquire(Duration::from_millis(200)));
        assert_eq!(rl.waiting_threads(), 0);
    }

    #[test]
    fn test_insufficient_wait_sleeps_and_fails() {
        let rl = limiter(1, Duration::from_secs(10));
        assert!(rl.try_acquire());

        let start = Instant::now();
        assert!(!rl.acquire(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        // the failed attempt reserved nothing
        assert_eq!(rl.available_permissions(), 0);
    }

    #[test]
    fn test_concurrent_acquire_grants_exact_limit() {
        let rl = Arc::new(limiter(50, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                thread::spawn(move || (0..25).filter(|_| rl.try_acquire()).count())
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }

    #[test]
    fn test_change_config_caps_permissions() {
        let rl = limiter(10, Duration::from_secs(60));
        rl.change_config(RateLimitConfig::new(2, Duration::from_secs(60)));

        assert_eq!(rl.config().limit_for_period, 2);
        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(!rl.try_acquire());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_double_limit_grants_exactly_limit(n in 1usize..200) {
            let rl = limiter(n, Duration::from_secs(3600));
            let granted = (0..2 * n).filter(|_| rl.try_acquire()).count();
            prop_assert_eq!(granted, n);
        }
    }
}
