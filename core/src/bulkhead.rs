//! Bulkhead implementation for concurrency limiting
//!
//! A bounded in-flight call counter. Entry increments the counter only while
//! it is below the threshold; a denied entry returns immediately and never
//! queues. The threshold itself can be replaced at runtime.

use crate::config::ConcurrentLimitConfig;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter-based concurrency limiter
#[derive(Debug)]
pub struct ConcurrentLimiter {
    name: String,
    config: ArcSwap<ConcurrentLimitConfig>,
    /// Current number of calls in flight
    acquired: AtomicUsize,
}

impl ConcurrentLimiter {
    pub fn new(name: impl Into<String>, config: ConcurrentLimitConfig) -> Self {
        Self {
            name: name.into(),
            config: ArcSwap::from_pointee(config),
            acquired: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to take a slot; `false` when the limiter is at its threshold
    pub fn enter(&self) -> bool {
        let threshold = self.threshold();
        self.acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < threshold {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Release a slot taken by [`enter`](Self::enter)
    pub fn exit(&self) {
        // Saturate so an unpaired exit cannot wrap the counter
        let _ = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    /// Take a slot released automatically when the permit drops
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConcurrencyPermit> {
        if self.enter() {
            Some(ConcurrencyPermit {
                limiter: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Replace the working configuration; calls in flight keep their slots
    pub fn change_config(&self, config: ConcurrentLimitConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn config(&self) -> Arc<ConcurrentLimitConfig> {
        self.config.load_full()
    }

    pub fn threshold(&self) -> usize {
        self.config.load().threshold
    }

    /// Number of calls currently in flight
    pub fn current_call_count(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    /// Slots still available
    pub fn available(&self) -> usize {
        self.threshold().saturating_sub(self.current_call_count())
    }
}

/// A held slot; dropping it releases the slot
///
/// This pairs every successful entry with exactly one exit, even when a later
/// moat rejects the call or the guarded operation panics.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    limiter: Arc<ConcurrentLimiter>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.limiter.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn limiter(threshold: usize) -> Arc<ConcurrentLimiter> {
        Arc::new(ConcurrentLimiter::new(
            "test",
            ConcurrentLimitConfig::new(threshold),
        ))
    }

    #[test]
    fn test_enter_exit_counts() {
        let cl = limiter(3);

        assert!(cl.enter());
        assert!(cl.enter());
        assert_eq!(cl.current_call_count(), 2);
        assert_eq!(cl.available(), 1);

        cl.exit();
        assert_eq!(cl.current_call_count(), 1);
    }

    #[test]
    fn test_at_capacity_rejects_immediately() {
        let cl = limiter(2);

        let p1 = cl.try_acquire().expect("Should acquire");
        let _p2 = cl.try_acquire().expect("Should acquire");
        assert!(cl.try_acquire().is_none(), "Should not acquire when at capacity");

        drop(p1);
        assert!(cl.try_acquire().is_some(), "Should acquire after release");
    }

    #[test]
    fn test_unpaired_exit_does_not_wrap() {
        let cl = limiter(1);
        cl.exit();
        assert_eq!(cl.current_call_count(), 0);
        assert!(cl.enter());
    }

    #[test]
    fn test_lowering_threshold_blocks_new_entries_only() {
        let cl = limiter(3);
        let _a = cl.try_acquire().unwrap();
        let _b = cl.try_acquire().unwrap();

        cl.change_config(ConcurrentLimitConfig::new(1));
        assert_eq!(cl.current_call_count(), 2);
        assert!(cl.try_acquire().is_none());
    }

    #[test]
    fn test_concurrent_entries_never_exceed_threshold() {
        let cl = limiter(5);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cl = Arc::clone(&cl);
                thread::spawn(move || cl.try_acquire())
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 5);

        drop(permits);
        assert_eq!(cl.current_call_count(), 0);
    }

    #[test]
    fn test_permit_releases_on_panic() {
        let cl = limiter(2);
        let cl_clone = Arc::clone(&cl);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _permit = cl_clone.try_acquire().unwrap();
            panic!("Simulated panic");
        }));

        assert!(result.is_err());
        assert_eq!(cl.current_call_count(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_double_threshold_grants_exactly_threshold(t in 1usize..100) {
            let cl = limiter(t);
            let granted = (0..2 * t).filter(|_| cl.enter()).count();
            prop_assert_eq!(granted, t);

            for _ in 0..granted {
                cl.exit();
            }
            prop_assert!(cl.enter());
        }
    }
}
