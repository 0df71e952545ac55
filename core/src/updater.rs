//! Dynamic configuration updates
//!
//! A config source hands over complete snapshots of the dynamic overrides.
//! The updater validates them, expands groups, diffs against the previous
//! snapshot, and cascades each change into the live clusters it affects:
//!
//! - an override for an existing moat swaps its working config in place
//! - a withdrawn override resets a permanent moat to its baseline and
//!   removes a temporary one
//! - an override for an engine the cluster lacks adds a temporary moat,
//!   subject to the creation-limit guard for argument-scoped resources
//! - a cluster left with no moats and no retry executor is dropped
//!
//! A malformed entry never reaches live state: it is logged and the
//! previously applied value for that resource stays in force.

use crate::cluster::ArgStatistics;
use crate::config::ResourceConfig;
use crate::errors::ConfigError;
use crate::keeper::Internals;
use crate::moat::MoatKind;
use crate::resource::ResourceId;
use crate::store::ConfigMap;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Per-resource change set: `Some` = added or changed, `None` = withdrawn
pub type ConfigDiff = HashMap<ResourceId, Option<ResourceConfig>>;

/// Changes turning `old` into `new`; unchanged resources are omitted
pub fn diff(old: &ConfigMap, new: &ConfigMap) -> ConfigDiff {
    let mut changes: ConfigDiff = new
        .iter()
        .filter(|(id, config)| old.get(*id) != Some(*config))
        .map(|(id, config)| (id.clone(), Some(config.clone())))
        .collect();
    for id in old.keys() {
        if !new.contains_key(id) {
            changes.insert(id.clone(), None);
        }
    }
    changes
}

/// Where dynamic configuration comes from
///
/// Implementations return the complete current set of overrides; polling
/// or file watching is up to the caller of [`crate::MoatKeeper::refresh`].
pub trait ConfigSource {
    fn load(&self) -> Result<ConfigMap, ConfigError>;
}

impl<F> ConfigSource for F
where
    F: Fn() -> Result<ConfigMap, ConfigError>,
{
    fn load(&self) -> Result<ConfigMap, ConfigError> {
        self()
    }
}

/// Decides whether a temporary argument-scoped moat may be created
pub trait CreationGuard: Send + Sync {
    /// `statistics` holds the live moat counts per argument
    fn can_create(
        &self,
        resource: &ResourceId,
        arg_name: &str,
        kind: MoatKind,
        statistics: &ArgStatistics,
    ) -> bool;
}

/// Caps the number of distinct argument values carrying a moat of each kind
#[derive(Debug, Clone, Copy)]
pub struct MaxValuesPerArg {
    pub max: usize,
}

impl Default for MaxValuesPerArg {
    fn default() -> Self {
        Self { max: 100 }
    }
}

impl CreationGuard for MaxValuesPerArg {
    fn can_create(
        &self,
        resource: &ResourceId,
        _arg_name: &str,
        kind: MoatKind,
        statistics: &ArgStatistics,
    ) -> bool {
        match resource.as_arg() {
            Some(arg) => statistics.count(arg, kind) < self.max,
            None => true,
        }
    }
}

/// Applies dynamic snapshots to live state
#[derive(Debug, Default)]
pub struct Updater {
    /// Last applied snapshot, before group expansion
    last: Mutex<ConfigMap>,
}

impl Updater {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last applied snapshot
    pub fn current(&self) -> ConfigMap {
        self.last.lock().clone()
    }

    /// Apply a complete snapshot; returns the number of changed resources
    pub(crate) fn update(&self, internals: &Internals, snapshot: ConfigMap) -> usize {
        let mut last = self.last.lock();

        let mut accepted = ConfigMap::with_capacity(snapshot.len());
        for (id, config) in snapshot {
            match internals.store.check(&id, &config) {
                Ok(()) => {
                    accepted.insert(id, config);
                }
                Err(err) => {
                    tracing::warn!(resource = %id, error = %err, "rejected dynamic config");
                    if let Some(previous) = last.get(&id) {
                        accepted.insert(id, previous.clone());
                    }
                }
            }
        }

        let old = internals.store.flatten(&last);
        let new = internals.store.flatten(&accepted);
        let changes = diff(&old, &new);
        for (id, config) in &changes {
            internals.store.set_dynamic(id.clone(), config.clone());
        }
        for id in changes.keys() {
            self.cascade(internals, id);
        }

        *last = accepted;
        changes.len()
    }

    /// Re-apply the effective dynamic config of every live cluster `changed` affects
    fn cascade(&self, internals: &Internals, changed: &ResourceId) {
        for resource in internals.registry.resources() {
            if !affects(internals, changed, &resource) {
                continue;
            }
            if let Some(cluster) = internals.registry.get(&resource) {
                let dynamic = internals.store.dynamic(&resource);
                internals.apply(&cluster, dynamic.as_ref());
            }
        }
    }
}

/// True when a change keyed by `changed` can alter the config of `resource`
fn affects(internals: &Internals, changed: &ResourceId, resource: &ResourceId) -> bool {
    if changed == resource {
        return true;
    }
    match (changed, resource) {
        (ResourceId::Arg(changed), ResourceId::Arg(arg)) => {
            changed.is_match_all() && changed.same_argument(arg)
        }
        (ResourceId::Regex(pattern), ResourceId::Method(name)) => {
            internals.store.pattern_matches(pattern, name)
        }
        _ => false,
    }
}
