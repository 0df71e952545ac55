//! Read-only metrics snapshots
//!
//! Every engine exposes a point-in-time snapshot for pull-based consumers.
//! Snapshots are plain values and serialize with serde.

use crate::circuit::CircuitState;
use crate::moat::{Lifecycle, MoatKind};
use crate::resource::ResourceId;
use serde::Serialize;

/// Snapshot of one moat's engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MoatMetrics {
    RateLimit {
        /// Threads sleeping for a reserved permit
        waiting_threads: usize,
        /// Permits left in the current cycle; negative while reservations are queued
        available_permissions: i64,
    },
    ConcurrentLimit {
        threshold: usize,
        current_call_count: usize,
    },
    CircuitBreaker(CircuitBreakerMetrics),
}

impl MoatMetrics {
    pub fn kind(&self) -> MoatKind {
        match self {
            MoatMetrics::RateLimit { .. } => MoatKind::RateLimit,
            MoatMetrics::ConcurrentLimit { .. } => MoatKind::ConcurrentLimit,
            MoatMetrics::CircuitBreaker(_) => MoatKind::CircuitBreaker,
        }
    }
}

/// Circuit breaker snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Failure percentage of the current ring, -1 until the ring is full
    pub failure_rate: f32,
    /// Outcomes currently in the ring
    pub buffered_calls: usize,
    /// Failures currently in the ring
    pub failed_calls: usize,
    /// Ring capacity for the current state
    pub max_buffered_calls: usize,
    /// Calls rejected since the current state was entered
    pub not_permitted_calls: u64,
}

/// Retry executor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    /// Calls that went through the executor
    pub total_calls: u64,
    /// Attempts made after the first one
    pub total_retries: u64,
    /// Calls that ran out of attempts
    pub exhausted: u64,
}

/// One moat inside a cluster snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoatSnapshot {
    pub lifecycle: Lifecycle,
    pub metrics: MoatMetrics,
}

/// Snapshot of every engine guarding one resource, in admission order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterMetrics {
    pub resource: ResourceId,
    pub moats: Vec<MoatSnapshot>,
    pub retry: Option<RetryMetrics>,
}

impl ClusterMetrics {
    /// Metrics of the moat of `kind`, if the cluster has one
    pub fn moat(&self, kind: MoatKind) -> Option<&MoatMetrics> {
        self.moats
            .iter()
            .map(|m| &m.metrics)
            .find(|m| m.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_metrics_serialize_tagged() {
        let metrics = ClusterMetrics {
            resource: ResourceId::method("svc"),
            moats: vec![MoatSnapshot {
                lifecycle: Lifecycle::Permanent,
                metrics: MoatMetrics::ConcurrentLimit {
                    threshold: 4,
                    current_call_count: 1,
                },
            }],
            retry: None,
        };

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["resource"], "svc");
        assert_eq!(json["moats"][0]["metrics"]["kind"], "concurrent_limit");
        assert_eq!(json["moats"][0]["lifecycle"], "permanent");
        assert_eq!(json["moats"][0]["metrics"]["threshold"], 4);
        assert!(metrics.moat(MoatKind::RateLimit).is_none());
    }
}
