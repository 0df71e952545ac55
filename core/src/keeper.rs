//! Caller-facing facade
//!
//! A [`MoatKeeper`] owns everything a process needs to protect its calls:
//! the config store, the cluster registry, the shared engine parts and the
//! dynamic updater. Clusters are built on first use from the baseline and
//! dynamic configuration effective for the resource at that moment; an
//! update landing while a cluster is being built is applied to it before
//! first use.

use crate::builder::MoatKeeperBuilder;
use crate::chain::ExecutionChain;
use crate::cluster::{ArgStatistics, ClusterRegistry, MoatCluster};
use crate::config::{EngineConfig, MoatConfig, ResourceConfig, SharedFallback};
use crate::errors::{BoxError, ConfigError, MoatError};
use crate::fallback::Fallback;
use crate::handle::{RequestHandle, SharedListeners};
use crate::metrics::ClusterMetrics;
use crate::moat::{EngineParts, Lifecycle, Moat, MoatKind};
use crate::resource::{ArgResourceId, ResourceId};
use crate::retry::RetryExecutor;
use crate::store::{ConfigMap, ConfigStore};
use crate::updater::{ConfigSource, CreationGuard, Updater};
use std::collections::HashMap;
use std::sync::Arc;

/// One call about to be made: the method and the argument values observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    method: String,
    args: Vec<ArgResourceId>,
}

impl Invocation {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Observe the value of argument `index` (named `name`)
    pub fn with_arg(
        mut self,
        index: usize,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.args.push(ArgResourceId {
            method: self.method.clone(),
            index,
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn method_id(&self) -> ResourceId {
        ResourceId::method(self.method.clone())
    }

    /// Method id followed by one id per observed argument value
    pub fn resources(&self) -> Vec<ResourceId> {
        std::iter::once(self.method_id())
            .chain(self.args.iter().cloned().map(ResourceId::Arg))
            .collect()
    }
}

/// Shared state behind a keeper
pub(crate) struct Internals {
    pub(crate) store: ConfigStore,
    pub(crate) registry: ClusterRegistry,
    pub(crate) parts: EngineParts,
    pub(crate) guard: Arc<dyn CreationGuard>,
    pub(crate) listeners: SharedListeners,
    pub(crate) fallbacks: HashMap<ResourceId, SharedFallback>,
}

impl Internals {
    /// Live cluster for `id`, built on first use
    ///
    /// Resources without any effective configuration get no cluster.
    pub(crate) fn cluster(&self, id: &ResourceId) -> Option<Arc<MoatCluster>> {
        self.registry.get(id).or_else(|| self.build_cluster(id, || {}))
    }

    /// Build, register and catch up a cluster for `id`
    ///
    /// `resolved` runs once the configs have been read; a dynamic update
    /// landing from then on is applied to the cluster before it is returned.
    fn build_cluster(&self, id: &ResourceId, resolved: impl FnOnce()) -> Option<Arc<MoatCluster>> {
        let mut generation = self.store.generation();
        let baseline = self.store.baseline(id);
        let dynamic = self.store.dynamic(id);
        if baseline.is_none() && dynamic.is_none() {
            return None;
        }
        resolved();

        let mut config = MoatConfig::new(id.clone());
        config.fallback = self.fallback_for(id);
        let candidate = self.registry.prepare(config);
        self.populate(&candidate, baseline.as_ref(), dynamic.as_ref());
        if candidate.is_empty() {
            return None;
        }
        let cluster = self.registry.register(candidate);

        // updates cascading before registration could not reach the cluster
        loop {
            let current = self.store.generation();
            if current == generation {
                break;
            }
            generation = current;
            self.apply(&cluster, self.store.dynamic(id).as_ref());
        }
        (!cluster.is_empty()).then_some(cluster)
    }

    fn fallback_for(&self, id: &ResourceId) -> Option<SharedFallback> {
        self.fallbacks
            .get(id)
            .or_else(|| id.as_arg().and_then(|arg| self.fallbacks.get(&arg.method_id())))
            .cloned()
    }

    /// Fill a new cluster: permanent moats from the baseline (with any
    /// override applied), temporary ones for engines only the override names
    fn populate(
        &self,
        cluster: &MoatCluster,
        baseline: Option<&ResourceConfig>,
        dynamic: Option<&ResourceConfig>,
    ) {
        for kind in MoatKind::ALL {
            let working = dynamic.and_then(|d| d.engine(kind));
            match (baseline.and_then(|b| b.engine(kind)), working) {
                (Some(base), working) => {
                    let moat = Moat::permanent(cluster.config().clone(), base, &self.parts);
                    if let Some(working) = working {
                        moat.update(&working);
                    }
                    cluster.add(moat);
                }
                (None, Some(working)) => {
                    self.add_temporary(cluster, working);
                }
                (None, None) => {}
            }
        }

        let resource = cluster.resource().clone();
        let registry = self.parts.registry.clone();
        match (
            baseline.and_then(|b| b.retry.clone()),
            dynamic.and_then(|d| d.retry.clone()),
        ) {
            (Some(base), working) => {
                let retry = RetryExecutor::permanent(resource, base, registry);
                if let Some(working) = working {
                    retry.change_config(working);
                }
                cluster.attach_retry(retry);
            }
            (None, Some(working)) => {
                cluster.attach_retry(RetryExecutor::new(resource, working, registry));
            }
            (None, None) => {}
        }
    }

    /// Bring a live cluster in line with its effective dynamic config
    pub(crate) fn apply(&self, cluster: &MoatCluster, dynamic: Option<&ResourceConfig>) {
        let resource = cluster.resource();
        for kind in MoatKind::ALL {
            let working = dynamic.and_then(|d| d.engine(kind));
            match (cluster.get(kind), working) {
                (Some(moat), Some(working)) => {
                    moat.update(&working);
                    tracing::debug!(%resource, %kind, "moat config updated");
                }
                (Some(moat), None) => match moat.lifecycle() {
                    Lifecycle::Permanent => {
                        moat.reset_to_baseline();
                        tracing::debug!(%resource, %kind, "moat reset to baseline");
                    }
                    Lifecycle::Temporary => {
                        cluster.remove(kind);
                        tracing::info!(%resource, %kind, "temporary moat removed");
                    }
                },
                (None, Some(working)) => {
                    if self.add_temporary(cluster, working) {
                        tracing::info!(%resource, %kind, "temporary moat added");
                    }
                }
                (None, None) => {}
            }
        }

        match (cluster.retry(), dynamic.and_then(|d| d.retry.clone())) {
            (Some(retry), Some(working)) => retry.change_config(working),
            (Some(retry), None) => match retry.lifecycle() {
                Lifecycle::Permanent => {
                    retry.reset_to_baseline();
                }
                Lifecycle::Temporary => {
                    cluster.detach_retry();
                    tracing::info!(%resource, "temporary retry removed");
                }
            },
            (None, Some(working)) => {
                cluster.attach_retry(RetryExecutor::new(
                    resource.clone(),
                    working,
                    self.parts.registry.clone(),
                ));
                tracing::info!(%resource, "temporary retry added");
            }
            (None, None) => {}
        }

        if cluster.is_empty() {
            self.registry.remove_if_empty(resource);
        } else if !self.registry.is_registered(cluster) {
            // removed as empty while this call was adding to it
            cluster.clear();
        }
    }

    /// Add a temporary moat unless the creation-limit guard refuses it
    fn add_temporary(&self, cluster: &MoatCluster, working: EngineConfig) -> bool {
        let resource = cluster.resource();
        let kind = working.kind();
        if let Some(arg) = resource.as_arg()
            && !self
                .guard
                .can_create(resource, &arg.name, kind, self.registry.statistics())
        {
            tracing::warn!(%resource, %kind, "creation limit reached, moat not created");
            return false;
        }
        cluster.add(Moat::temporary(cluster.config().clone(), working, &self.parts))
    }
}

/// Protects calls per resource
///
/// # Examples
///
/// ```rust
/// use moat_machines::{
///     ConcurrentLimitConfig, Invocation, MoatKeeper, ResourceConfig, ResourceId,
/// };
///
/// let keeper = MoatKeeper::builder()
///     .resource(
///         ResourceId::method("inventory.reserve"),
///         ResourceConfig::new().with_concurrent_limit(ConcurrentLimitConfig::new(8)),
///     )
///     .build()
///     .unwrap();
///
/// let reserved = keeper.execute(&Invocation::new("inventory.reserve"), &3u32, |qty| {
///     Ok(*qty)
/// });
/// assert_eq!(reserved.unwrap(), 3);
/// ```
pub struct MoatKeeper {
    internals: Internals,
    updater: Updater,
}

impl MoatKeeper {
    pub fn builder() -> MoatKeeperBuilder {
        MoatKeeperBuilder::new()
    }

    pub(crate) fn from_internals(internals: Internals) -> Self {
        Self {
            internals,
            updater: Updater::new(),
        }
    }

    /// Execution chain over every cluster `invocation` touches
    pub fn chain(&self, invocation: &Invocation) -> ExecutionChain {
        let clusters = invocation
            .resources()
            .iter()
            .filter_map(|id| self.internals.cluster(id))
            .collect();
        ExecutionChain::new(
            invocation.method_id(),
            clusters,
            self.internals.parts.registry.clone(),
            Arc::clone(&self.internals.listeners),
        )
    }

    /// Run `call` under protection; configured fallbacks apply
    pub fn execute<A, T, F>(&self, invocation: &Invocation, args: &A, call: F) -> Result<T, MoatError>
    where
        A: 'static,
        T: 'static,
        F: FnMut(&A) -> Result<T, BoxError>,
    {
        self.chain(invocation).execute(args, call, None)
    }

    /// Run `call` under protection with a call-site fallback
    pub fn execute_with_fallback<A, T, F>(
        &self,
        invocation: &Invocation,
        args: &A,
        call: F,
        fallback: &Fallback<A, T>,
    ) -> Result<T, MoatError>
    where
        A: 'static,
        T: 'static,
        F: FnMut(&A) -> Result<T, BoxError>,
    {
        self.chain(invocation).execute(args, call, Some(fallback))
    }

    /// Admit a call the caller completes through the returned handle
    pub fn try_to_execute<A, T>(&self, invocation: &Invocation, args: &A) -> RequestHandle<T>
    where
        A: 'static,
        T: 'static,
    {
        self.chain(invocation).try_to_execute(args)
    }

    pub fn try_to_execute_with<A, T>(
        &self,
        invocation: &Invocation,
        args: &A,
        fallback: &Fallback<A, T>,
    ) -> RequestHandle<T>
    where
        A: 'static,
        T: 'static,
    {
        self.chain(invocation).try_to_execute_with(args, Some(fallback))
    }

    /// Apply a complete snapshot of dynamic overrides
    ///
    /// Returns how many resources changed. Malformed entries are logged and
    /// skipped; the value previously applied for them stays in force.
    pub fn update(&self, snapshot: ConfigMap) -> usize {
        self.updater.update(&self.internals, snapshot)
    }

    /// Load a snapshot from `source` and apply it
    ///
    /// A failing source leaves all live state untouched.
    pub fn refresh(&self, source: &dyn ConfigSource) -> Result<usize, ConfigError> {
        let snapshot = source.load().inspect_err(|err| {
            tracing::warn!(error = %err, "config source failed, keeping current config");
        })?;
        Ok(self.update(snapshot))
    }

    /// The dynamic overrides currently applied
    pub fn dynamic_config(&self) -> ConfigMap {
        self.updater.current()
    }

    /// Live cluster for `id`, if one exists
    pub fn cluster(&self, id: &ResourceId) -> Option<Arc<MoatCluster>> {
        self.internals.registry.get(id)
    }

    pub fn metrics(&self, id: &ResourceId) -> Option<ClusterMetrics> {
        self.cluster(id).map(|c| c.metrics())
    }

    /// Ids of every live cluster
    pub fn resources(&self) -> Vec<ResourceId> {
        self.internals.registry.resources()
    }

    pub fn arg_statistics(&self) -> &ArgStatistics {
        self.internals.registry.statistics()
    }
}

impl std::fmt::Debug for MoatKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoatKeeper")
            .field("clusters", &self.internals.registry.len())
            .field("fallbacks", &self.internals.fallbacks.len())
            .finish()
    }
}
