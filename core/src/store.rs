//! Baseline and dynamic configuration, resolved per concrete resource
//!
//! Configuration is keyed by [`ResourceId`] of any variant, but engines only
//! ever see method and argument ids. Group entries are expanded to their
//! members on the way in (a member's own entry wins over its group's), and
//! regex entries are consulted when a method has no entry of its own.
//!
//! Resolution order:
//!
//! - method id: direct entry (including ones expanded from groups), then
//!   the lexically first regex entry whose pattern matches the full name
//! - argument id: the exact value's entry, then the match-all (`*`) entry
//!   of the same argument
//!
//! Every dynamic change bumps a generation counter, which lets a reader
//! notice that the overrides it resolved have since moved on.

use crate::config::ResourceConfig;
use crate::errors::ConfigError;
use crate::resource::ResourceId;
use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Raw configuration as written by users or config sources
pub type ConfigMap = HashMap<ResourceId, ResourceConfig>;

/// Compile `pattern` so it must match a whole method name
pub fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|err| ConfigError::Pattern {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

/// Baseline (immutable) and dynamic (replaceable) configuration
#[derive(Debug)]
pub struct ConfigStore {
    baselines: ConfigMap,
    groups: HashMap<String, Vec<ResourceId>>,
    dynamic: DashMap<ResourceId, ResourceConfig>,
    generation: AtomicU64,
    patterns: DashMap<String, Regex>,
}

impl ConfigStore {
    /// Store with the given baselines; groups map a group name to member ids
    pub fn new(
        baselines: ConfigMap,
        groups: HashMap<String, Vec<ResourceId>>,
    ) -> Result<Self, ConfigError> {
        for members in groups.values() {
            if let Some(bad) = members.iter().find(|m| !matches!(m, ResourceId::Method(_))) {
                return Err(ConfigError::Unsupported(bad.clone()));
            }
        }
        let mut store = Self {
            baselines: ConfigMap::new(),
            groups,
            dynamic: DashMap::new(),
            generation: AtomicU64::new(0),
            patterns: DashMap::new(),
        };
        for (id, config) in &baselines {
            store.check(id, config)?;
        }
        store.baselines = store.flatten(&baselines);
        Ok(store)
    }

    /// Validate one entry: engine limits and, for regex ids, the pattern
    pub fn check(&self, id: &ResourceId, config: &ResourceConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let ResourceId::Regex(pattern) = id {
            self.pattern(pattern)?;
        }
        Ok(())
    }

    /// Members of a registered group
    pub fn group(&self, name: &str) -> Option<&[ResourceId]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// Expand group entries into their members
    ///
    /// Members that carry an entry of their own keep it. Entries for unknown
    /// groups are dropped with a warning.
    pub fn flatten(&self, raw: &ConfigMap) -> ConfigMap {
        let mut flat: ConfigMap = raw
            .iter()
            .filter(|(id, _)| !matches!(id, ResourceId::Group(_)))
            .map(|(id, config)| (id.clone(), config.clone()))
            .collect();

        let mut groups: Vec<(&String, &ResourceConfig)> = raw
            .iter()
            .filter_map(|(id, config)| match id {
                ResourceId::Group(name) => Some((name, config)),
                _ => None,
            })
            .collect();
        // a member of several groups takes the first group's config by name
        groups.sort_by(|a, b| a.0.cmp(b.0));

        for (name, config) in groups {
            let Some(members) = self.groups.get(name) else {
                tracing::warn!(group = %name, "config for unknown group ignored");
                continue;
            };
            for member in members {
                if !raw.contains_key(member) {
                    flat.entry(member.clone()).or_insert_with(|| config.clone());
                }
            }
        }
        flat
    }

    /// Effective baseline for a concrete resource
    pub fn baseline(&self, id: &ResourceId) -> Option<ResourceConfig> {
        resolve(id, |key| self.baselines.get(key).cloned(), || {
            self.matching_pattern(self.baselines.keys(), id)
                .and_then(|key| self.baselines.get(&key).cloned())
        })
    }

    /// Effective dynamic override for a concrete resource
    pub fn dynamic(&self, id: &ResourceId) -> Option<ResourceConfig> {
        resolve(
            id,
            |key| self.dynamic.get(key).map(|c| c.value().clone()),
            || {
                let keys: Vec<ResourceId> = self
                    .dynamic
                    .iter()
                    .filter(|e| matches!(e.key(), ResourceId::Regex(_)))
                    .map(|e| e.key().clone())
                    .collect();
                self.matching_pattern(keys.iter(), id)
                    .and_then(|key| self.dynamic.get(&key).map(|c| c.value().clone()))
            },
        )
    }

    /// Install (`Some`) or withdraw (`None`) the dynamic override of `id`
    pub fn set_dynamic(&self, id: ResourceId, config: Option<ResourceConfig>) {
        match config {
            Some(config) => {
                self.dynamic.insert(id, config);
            }
            None => {
                self.dynamic.remove(&id);
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of dynamic changes installed so far
    ///
    /// Read it before resolving: an unchanged generation afterwards means
    /// nothing resolved since is stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// True when a method named `name` falls under the regex `pattern`
    pub fn pattern_matches(&self, pattern: &str, name: &str) -> bool {
        self.pattern(pattern).is_ok_and(|re| re.is_match(name))
    }

    fn pattern(&self, pattern: &str) -> Result<Regex, ConfigError> {
        if let Some(re) = self.patterns.get(pattern) {
            return Ok(re.value().clone());
        }
        let re = compile_pattern(pattern)?;
        self.patterns.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    /// First regex key (by pattern text) matching the method id
    fn matching_pattern<'a>(
        &self,
        keys: impl Iterator<Item = &'a ResourceId>,
        id: &ResourceId,
    ) -> Option<ResourceId> {
        let ResourceId::Method(name) = id else {
            return None;
        };
        keys.filter(|key| match key {
            ResourceId::Regex(pattern) => self.pattern_matches(pattern, name),
            _ => false,
        })
        .min()
        .cloned()
    }
}

/// Direct lookup, then match-all (argument ids) or regex (method ids)
fn resolve<L, R>(id: &ResourceId, lookup: L, by_pattern: R) -> Option<ResourceConfig>
where
    L: Fn(&ResourceId) -> Option<ResourceConfig>,
    R: FnOnce() -> Option<ResourceConfig>,
{
    match id {
        ResourceId::Method(_) => lookup(id).or_else(by_pattern),
        ResourceId::Arg(arg) => lookup(id).or_else(|| lookup(&ResourceId::Arg(arg.match_all()))),
        ResourceId::Group(_) | ResourceId::Regex(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrentLimitConfig, RateLimitConfig};
    use std::time::Duration;

    fn limited(threshold: usize) -> ResourceConfig {
        ResourceConfig::new().with_concurrent_limit(ConcurrentLimitConfig::new(threshold))
    }

    fn threshold(config: Option<ResourceConfig>) -> Option<usize> {
        config.and_then(|c| c.concurrent_limit).map(|c| c.threshold)
    }

    fn store(baselines: ConfigMap) -> ConfigStore {
        let groups = HashMap::from([(
            "checkout".to_string(),
            vec![ResourceId::method("cart.pay"), ResourceId::method("cart.ship")],
        )]);
        ConfigStore::new(baselines, groups).unwrap()
    }

    #[test]
    fn test_group_expands_to_members_without_own_entry() {
        let store = store(HashMap::from([
            (ResourceId::group("checkout"), limited(5)),
            (ResourceId::method("cart.ship"), limited(1)),
        ]));

        assert_eq!(threshold(store.baseline(&ResourceId::method("cart.pay"))), Some(5));
        assert_eq!(threshold(store.baseline(&ResourceId::method("cart.ship"))), Some(1));
        assert_eq!(store.baseline(&ResourceId::method("cart.view")), None);
    }

    #[test]
    fn test_regex_applies_when_nothing_direct() {
        let store = store(HashMap::from([
            (ResourceId::regex(r"cart\..*"), limited(9)),
            (ResourceId::method("cart.pay"), limited(2)),
        ]));

        assert_eq!(threshold(store.baseline(&ResourceId::method("cart.view"))), Some(9));
        assert_eq!(threshold(store.baseline(&ResourceId::method("cart.pay"))), Some(2));
        // full-name match only
        assert_eq!(store.baseline(&ResourceId::method("oldcart.view")), None);
    }

    #[test]
    fn test_arg_resolution_prefers_exact_value() {
        let store = store(ConfigMap::new());
        store.set_dynamic(ResourceId::arg("svc", 0, "tenant", "*"), Some(limited(3)));
        store.set_dynamic(ResourceId::arg("svc", 0, "tenant", "vip"), Some(limited(30)));

        let dynamic = |value| threshold(store.dynamic(&ResourceId::arg("svc", 0, "tenant", value)));
        assert_eq!(dynamic("vip"), Some(30));
        assert_eq!(dynamic("acme"), Some(3));

        store.set_dynamic(ResourceId::arg("svc", 0, "tenant", "*"), None);
        assert_eq!(dynamic("acme"), None);
    }

    #[test]
    fn test_invalid_baseline_rejected() {
        let bad_pattern = ConfigStore::new(
            HashMap::from([(ResourceId::regex("cart.("), limited(1))]),
            HashMap::new(),
        );
        assert!(matches!(bad_pattern, Err(ConfigError::Pattern { .. })));

        let zero_limit = ConfigStore::new(
            HashMap::from([(
                ResourceId::method("svc"),
                ResourceConfig::new().with_rate_limit(RateLimitConfig::new(0, Duration::from_secs(1))),
            )]),
            HashMap::new(),
        );
        assert!(matches!(zero_limit, Err(ConfigError::Zero { .. })));
    }

    #[test]
    fn test_group_members_must_be_methods() {
        let result = ConfigStore::new(
            ConfigMap::new(),
            HashMap::from([("g".to_string(), vec![ResourceId::regex(".*")])]),
        );
        assert!(matches!(result, Err(ConfigError::Unsupported(_))));
    }
}
