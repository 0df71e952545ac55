//! Moat clusters and the cluster registry
//!
//! A [`MoatCluster`] holds every moat guarding one resource, sorted by
//! admission order, plus an optional retry executor. The moat list is a
//! copy-on-write snapshot: admission iterates an immutable `Arc<Vec<_>>`
//! without locking, and the rare structural changes publish a new list.
//!
//! The [`ClusterRegistry`] maps resources to clusters. A cluster is filled
//! before it is registered and at most one cluster is ever registered per
//! resource; no listener runs while a registry entry is locked. The registry
//! also keeps the live per-argument moat counts the creation-limit guard
//! reads.

use crate::callbacks::Listeners;
use crate::config::MoatConfig;
use crate::errors::NotPermitted;
use crate::metrics::{ClusterMetrics, MoatSnapshot};
use crate::moat::{Lifecycle, Moat, MoatKind, Ticket};
use crate::resource::{ArgResourceId, ResourceId};
use crate::retry::RetryExecutor;
use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Structural change of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    MoatAdded {
        resource: ResourceId,
        kind: MoatKind,
        lifecycle: Lifecycle,
    },
    MoatRemoved {
        resource: ResourceId,
        kind: MoatKind,
        lifecycle: Lifecycle,
    },
    RetryAttached {
        resource: ResourceId,
    },
    RetryDetached {
        resource: ResourceId,
    },
}

/// Ordered moats of one resource
pub struct MoatCluster {
    config: MoatConfig,
    moats: ArcSwap<Vec<Arc<Moat>>>,
    retry: ArcSwapOption<RetryExecutor>,
    listeners: Listeners<ClusterEvent>,
}

impl MoatCluster {
    pub fn new(config: MoatConfig, listeners: Listeners<ClusterEvent>) -> Self {
        Self {
            config,
            moats: ArcSwap::from_pointee(Vec::new()),
            retry: ArcSwapOption::empty(),
            listeners,
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.config.resource
    }

    pub fn config(&self) -> &MoatConfig {
        &self.config
    }

    /// Current moats in admission order
    pub fn moats(&self) -> Arc<Vec<Arc<Moat>>> {
        self.moats.load_full()
    }

    pub fn get(&self, kind: MoatKind) -> Option<Arc<Moat>> {
        self.moats.load().iter().find(|m| m.kind() == kind).cloned()
    }

    /// Insert `moat` at its admission position
    ///
    /// Returns `false` (and drops `moat`) when the cluster already has a moat
    /// of the same kind.
    pub fn add(&self, moat: Moat) -> bool {
        let kind = moat.kind();
        let lifecycle = moat.lifecycle();
        let moat = Arc::new(moat);
        loop {
            let current = self.moats.load_full();
            if current.iter().any(|m| m.kind() == kind) {
                return false;
            }
            let mut next: Vec<Arc<Moat>> = current.as_ref().clone();
            let at = next.partition_point(|m| m.order() <= moat.order());
            next.insert(at, Arc::clone(&moat));

            let witnessed = self.moats.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*witnessed, &current) {
                break;
            }
        }
        self.listeners.notify(&ClusterEvent::MoatAdded {
            resource: self.resource().clone(),
            kind,
            lifecycle,
        });
        true
    }

    /// Remove the moat of `kind`
    pub fn remove(&self, kind: MoatKind) -> Option<Arc<Moat>> {
        let removed = loop {
            let current = self.moats.load_full();
            let Some(found) = current.iter().find(|m| m.kind() == kind).cloned() else {
                return None;
            };
            let next: Vec<Arc<Moat>> = current
                .iter()
                .filter(|m| m.kind() != kind)
                .cloned()
                .collect();

            let witnessed = self.moats.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*witnessed, &current) {
                break found;
            }
        };
        self.listeners.notify(&ClusterEvent::MoatRemoved {
            resource: self.resource().clone(),
            kind,
            lifecycle: removed.lifecycle(),
        });
        Some(removed)
    }

    pub fn retry(&self) -> Option<Arc<RetryExecutor>> {
        self.retry.load_full()
    }

    /// Attach a retry executor, replacing any previous one
    pub fn attach_retry(&self, retry: RetryExecutor) {
        self.retry.store(Some(Arc::new(retry)));
        self.listeners.notify(&ClusterEvent::RetryAttached {
            resource: self.resource().clone(),
        });
    }

    pub fn detach_retry(&self) -> Option<Arc<RetryExecutor>> {
        let detached = self.retry.swap(None);
        if detached.is_some() {
            self.listeners.notify(&ClusterEvent::RetryDetached {
                resource: self.resource().clone(),
            });
        }
        detached
    }

    /// Remove every moat and the retry executor
    pub fn clear(&self) {
        for kind in MoatKind::ALL {
            self.remove(kind);
        }
        self.detach_retry();
    }

    /// No moats and no retry executor: eligible for removal
    pub fn is_empty(&self) -> bool {
        self.moats.load().is_empty() && self.retry.load().is_none()
    }

    /// Admit a call through every moat in order
    ///
    /// On the first rejection the tickets taken so far are dropped, which
    /// releases held concurrency slots. Rate limit permits already granted
    /// stay consumed.
    pub fn try_enter_all(&self) -> Result<Vec<(Arc<Moat>, Ticket)>, NotPermitted> {
        let moats = self.moats.load_full();
        let mut entered = Vec::with_capacity(moats.len());
        for moat in moats.iter() {
            let ticket = moat.try_enter()?;
            entered.push((Arc::clone(moat), ticket));
        }
        Ok(entered)
    }

    pub fn metrics(&self) -> ClusterMetrics {
        ClusterMetrics {
            resource: self.resource().clone(),
            moats: self
                .moats
                .load()
                .iter()
                .map(|m| MoatSnapshot {
                    lifecycle: m.lifecycle(),
                    metrics: m.metrics(),
                })
                .collect(),
            retry: self.retry.load().as_ref().map(|r| r.metrics()),
        }
    }
}

impl std::fmt::Debug for MoatCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<MoatKind> = self.moats.load().iter().map(|m| m.kind()).collect();
        f.debug_struct("MoatCluster")
            .field("resource", self.resource())
            .field("moats", &kinds)
            .field("retry", &self.retry.load().is_some())
            .finish()
    }
}

/// Live moat counts per argument and engine kind
#[derive(Debug, Default)]
pub struct ArgStatistics {
    counts: DashMap<(String, usize, String, MoatKind), AtomicUsize>,
}

impl ArgStatistics {
    fn key(arg: &ArgResourceId, kind: MoatKind) -> (String, usize, String, MoatKind) {
        (arg.method.clone(), arg.index, arg.name.clone(), kind)
    }

    /// Moats of `kind` currently alive across all values of the argument
    pub fn count(&self, arg: &ArgResourceId, kind: MoatKind) -> usize {
        self.counts
            .get(&Self::key(arg, kind))
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn record(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::MoatAdded {
                resource: ResourceId::Arg(arg),
                kind,
                ..
            } => {
                self.counts
                    .entry(Self::key(arg, *kind))
                    .or_default()
                    .fetch_add(1, Ordering::AcqRel);
            }
            ClusterEvent::MoatRemoved {
                resource: ResourceId::Arg(arg),
                kind,
                ..
            } => {
                if let Some(count) = self.counts.get(&Self::key(arg, *kind)) {
                    let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                        c.checked_sub(1)
                    });
                }
            }
            _ => {}
        }
    }
}

/// Resource -> cluster mapping
#[derive(Debug)]
pub struct ClusterRegistry {
    clusters: DashMap<ResourceId, Arc<MoatCluster>>,
    statistics: Arc<ArgStatistics>,
    listeners: Listeners<ClusterEvent>,
}

impl ClusterRegistry {
    /// `listeners` observe every cluster the registry creates, after the
    /// statistics listener
    pub fn new(listeners: Listeners<ClusterEvent>) -> Self {
        let statistics = Arc::new(ArgStatistics::default());
        let recorder = Arc::clone(&statistics);
        let mut all = Listeners::new().with(move |event: &ClusterEvent| recorder.record(event));
        all.extend(&listeners);
        Self {
            clusters: DashMap::new(),
            statistics,
            listeners: all,
        }
    }

    pub fn get(&self, resource: &ResourceId) -> Option<Arc<MoatCluster>> {
        self.clusters.get(resource).map(|c| Arc::clone(c.value()))
    }

    /// Empty cluster reporting to the registry's listeners, not yet registered
    pub fn prepare(&self, config: MoatConfig) -> MoatCluster {
        MoatCluster::new(config, self.listeners.clone())
    }

    /// Register a cluster built by [`prepare`](Self::prepare)
    ///
    /// When another cluster is already registered for the resource, that one
    /// is returned and `candidate` is cleared, so its moats are reported as
    /// removed.
    pub fn register(&self, candidate: MoatCluster) -> Arc<MoatCluster> {
        let resource = candidate.resource().clone();
        let candidate = Arc::new(candidate);
        let existing = match self.clusters.entry(resource.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&candidate));
                tracing::debug!(%resource, "moat cluster created");
                return candidate;
            }
        };
        candidate.clear();
        existing
    }

    /// True while `cluster` is the one registered for its resource
    pub fn is_registered(&self, cluster: &MoatCluster) -> bool {
        self.clusters
            .get(cluster.resource())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c.value()), cluster))
    }

    /// Drop the cluster for `resource` if it has nothing left
    pub fn remove_if_empty(&self, resource: &ResourceId) -> bool {
        let removed = self
            .clusters
            .remove_if(resource, |_, cluster| cluster.is_empty())
            .is_some();
        if removed {
            tracing::info!(%resource, "moat cluster removed");
        }
        removed
    }

    /// Ids of every live cluster
    pub fn resources(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.clusters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn statistics(&self) -> &ArgStatistics {
        &self.statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, ConcurrentLimitConfig, EngineConfig, RateLimitConfig};
    use crate::moat::EngineParts;
    use std::thread;
    use std::time::Duration;

    fn moat(resource: &ResourceId, config: EngineConfig) -> Moat {
        Moat::temporary(MoatConfig::new(resource.clone()), config, &EngineParts::default())
    }

    fn concurrent(threshold: usize) -> EngineConfig {
        EngineConfig::ConcurrentLimit(ConcurrentLimitConfig::new(threshold))
    }

    #[test]
    fn test_moats_sorted_by_admission_order() {
        let id = ResourceId::method("svc");
        let cluster = MoatCluster::new(MoatConfig::new(id.clone()), Listeners::new());

        assert!(cluster.add(moat(&id, EngineConfig::CircuitBreaker(CircuitBreakerConfig::default()))));
        assert!(cluster.add(moat(&id, EngineConfig::RateLimit(RateLimitConfig::default()))));
        assert!(cluster.add(moat(&id, concurrent(1))));

        let kinds: Vec<MoatKind> = cluster.moats().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, MoatKind::ALL.to_vec());
    }

    #[test]
    fn test_one_moat_per_kind() {
        let id = ResourceId::method("svc");
        let cluster = MoatCluster::new(MoatConfig::new(id.clone()), Listeners::new());

        assert!(cluster.add(moat(&id, concurrent(1))));
        assert!(!cluster.add(moat(&id, concurrent(5))));
        assert_eq!(cluster.moats().len(), 1);
    }

    #[test]
    fn test_rejection_releases_held_slots() {
        let id = ResourceId::method("svc");
        let cluster = MoatCluster::new(MoatConfig::new(id.clone()), Listeners::new());
        cluster.add(moat(&id, concurrent(1)));
        cluster.add(moat(
            &id,
            EngineConfig::RateLimit(RateLimitConfig::new(1, Duration::from_secs(3600))),
        ));

        let first = cluster.try_enter_all().expect("first call admitted");
        drop(first);

        // rate limit rejects after the concurrency slot was taken
        let rejected = cluster.try_enter_all().unwrap_err();
        assert_eq!(rejected.kind, MoatKind::RateLimit);
        match cluster.get(MoatKind::ConcurrentLimit).unwrap().metrics() {
            crate::metrics::MoatMetrics::ConcurrentLimit {
                current_call_count, ..
            } => assert_eq!(current_call_count, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_remove_and_emptiness() {
        let id = ResourceId::method("svc");
        let cluster = MoatCluster::new(MoatConfig::new(id.clone()), Listeners::new());
        cluster.add(moat(&id, concurrent(1)));
        cluster.attach_retry(RetryExecutor::new(id.clone(), Default::default(), Default::default()));

        assert!(cluster.remove(MoatKind::ConcurrentLimit).is_some());
        assert!(cluster.remove(MoatKind::ConcurrentLimit).is_none());
        assert!(!cluster.is_empty());

        assert!(cluster.detach_retry().is_some());
        assert!(cluster.is_empty());
    }

    #[test]
    fn test_events_published_on_change() {
        let id = ResourceId::method("svc");
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let cluster = MoatCluster::new(
            MoatConfig::new(id.clone()),
            Listeners::new().with(move |e: &ClusterEvent| sink.lock().push(e.clone())),
        );

        cluster.add(moat(&id, concurrent(1)));
        cluster.remove(MoatKind::ConcurrentLimit);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ClusterEvent::MoatAdded { kind: MoatKind::ConcurrentLimit, .. }));
        assert!(matches!(events[1], ClusterEvent::MoatRemoved { lifecycle: Lifecycle::Temporary, .. }));
    }

    #[test]
    fn test_registry_registers_once() {
        let registry = Arc::new(ClusterRegistry::new(Listeners::new()));
        let id = ResourceId::arg("svc", 0, "tenant", "a");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                thread::spawn(move || {
                    let candidate = registry.prepare(MoatConfig::new(id.clone()));
                    candidate.add(moat(&id, concurrent(1)));
                    registry.register(candidate)
                })
            })
            .collect();
        let clusters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(clusters.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(registry.is_registered(&clusters[0]));
        // losing candidates withdrew their moats
        let arg = id.as_arg().unwrap();
        assert_eq!(registry.statistics().count(arg, MoatKind::ConcurrentLimit), 1);
    }

    #[test]
    fn test_losing_candidate_notifies_outside_entry_lock() {
        let registry = Arc::new(ClusterRegistry::new(Listeners::new()));
        let id = ResourceId::method("svc");
        let first = registry.prepare(MoatConfig::new(id.clone()));
        first.add(moat(&id, concurrent(1)));
        let winner = registry.register(first);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observer = Arc::clone(&registry);
        let sink = Arc::clone(&seen);
        let candidate = MoatCluster::new(
            MoatConfig::new(id.clone()),
            Listeners::new()
                .with(move |e: &ClusterEvent| sink.lock().push((e.clone(), observer.resources()))),
        );
        candidate.add(moat(&id, concurrent(2)));

        let registered = registry.register(candidate);
        assert!(Arc::ptr_eq(&registered, &winner));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[1].0, ClusterEvent::MoatRemoved { .. }));
        assert_eq!(seen[1].1, vec![id]);
    }

    #[test]
    fn test_registry_tracks_arg_moat_counts() {
        let registry = ClusterRegistry::new(Listeners::new());
        let a = ResourceId::arg("svc", 0, "tenant", "a");
        let b = ResourceId::arg("svc", 0, "tenant", "b");

        for id in [&a, &b] {
            let candidate = registry.prepare(MoatConfig::new(id.clone()));
            candidate.add(moat(id, concurrent(1)));
            registry.register(candidate);
        }
        let arg = a.as_arg().unwrap();
        assert_eq!(registry.statistics().count(arg, MoatKind::ConcurrentLimit), 2);
        assert_eq!(registry.statistics().count(arg, MoatKind::RateLimit), 0);

        registry.get(&a).unwrap().remove(MoatKind::ConcurrentLimit);
        assert_eq!(registry.statistics().count(arg, MoatKind::ConcurrentLimit), 1);
        assert!(registry.remove_if_empty(&a));
        assert!(!registry.remove_if_empty(&b));
        assert_eq!(registry.resources(), vec![b.clone()]);
    }
}
