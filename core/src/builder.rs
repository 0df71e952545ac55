//! Builder API for ergonomic keeper configuration

use crate::{
    callbacks::{Callbacks, Listeners, StateTransition},
    class::{ClassRegistry, ErrorClass},
    classifier::FailureClassifier,
    cluster::{ClusterEvent, ClusterRegistry},
    config::{ResourceConfig, SharedFallback},
    errors::ConfigError,
    fallback::Fallback,
    handle::InvocationListener,
    keeper::{Internals, MoatKeeper},
    moat::EngineParts,
    resource::ResourceId,
    store::{ConfigMap, ConfigStore},
    updater::{CreationGuard, MaxValuesPerArg},
};
use std::collections::HashMap;
use std::sync::Arc;

/// Builder for creating a [`MoatKeeper`] with fluent API
pub struct MoatKeeperBuilder {
    resources: ConfigMap,
    groups: HashMap<String, Vec<ResourceId>>,
    fallbacks: HashMap<ResourceId, SharedFallback>,
    registry: ClassRegistry,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    cluster_listeners: Listeners<ClusterEvent>,
    invocation_listeners: Vec<Arc<dyn InvocationListener>>,
    creation_guard: Option<Arc<dyn CreationGuard>>,
    max_values_per_arg: usize,
}

impl MoatKeeperBuilder {
    pub fn new() -> Self {
        Self {
            resources: ConfigMap::new(),
            groups: HashMap::new(),
            fallbacks: HashMap::new(),
            registry: ClassRegistry::new(),
            failure_classifier: None,
            callbacks: Callbacks::new(),
            cluster_listeners: Listeners::new(),
            invocation_listeners: Vec::new(),
            creation_guard: None,
            max_values_per_arg: MaxValuesPerArg::default().max,
        }
    }

    /// Set the baseline config of a resource
    ///
    /// `id` may be a method, an argument value (or the match-all value `*`),
    /// a group registered with [`group`](Self::group), or a regex.
    pub fn resource(mut self, id: ResourceId, config: ResourceConfig) -> Self {
        self.resources.insert(id, config);
        self
    }

    /// Register a named group of methods
    pub fn group<I>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = ResourceId>,
    {
        self.groups.insert(name.into(), members.into_iter().collect());
        self
    }

    /// Fallback for calls of signature `(A) -> T` on a method or group
    ///
    /// Argument-scoped clusters share the fallback of their method.
    pub fn fallback<A, T>(mut self, id: ResourceId, fallback: Fallback<A, T>) -> Self
    where
        A: 'static,
        T: 'static,
    {
        self.fallbacks.insert(id, Arc::new(fallback));
        self
    }

    /// Replace the error class registry
    pub fn class_registry(mut self, registry: ClassRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Classify every error of type `E` as `class`
    pub fn classify<E>(mut self, class: impl Into<ErrorClass>) -> Self
    where
        E: std::error::Error + 'static,
    {
        self.registry = self.registry.register::<E>(class);
        self
    }

    /// Set a failure classifier deciding which outcomes count against breakers
    ///
    /// Replaces the error rules derived from each breaker's `ignore_classes`.
    /// A breaker's `max_spend_time` still applies first: a slower call counts
    /// as a failure whatever `classifier` says.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use moat_machines::{MoatKeeper, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let keeper = MoatKeeper::builder()
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only slow errors count
    ///         ctx.error.is_some() && ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for circuit breaker state transitions
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.push(f);
        self
    }

    /// Set callback for moats and retry executors added to or removed from clusters
    ///
    /// Listeners run on the thread making the change and never while a
    /// registry entry is locked, so they may query the keeper.
    pub fn on_cluster_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClusterEvent) + Send + Sync + 'static,
    {
        self.cluster_listeners.push(f);
        self
    }

    /// Observe every completed invocation
    pub fn invocation_listener<L>(mut self, listener: L) -> Self
    where
        L: InvocationListener + 'static,
    {
        self.invocation_listeners.push(Arc::new(listener));
        self
    }

    /// Cap the argument values of one argument carrying temporary moats
    pub fn max_values_per_arg(mut self, max: usize) -> Self {
        self.max_values_per_arg = max;
        self
    }

    /// Replace the creation-limit guard; overrides `max_values_per_arg`
    pub fn creation_guard(mut self, guard: Arc<dyn CreationGuard>) -> Self {
        self.creation_guard = Some(guard);
        self
    }

    /// Build the keeper
    ///
    /// Fails when a baseline config is malformed, a regex does not compile,
    /// or a group lists something other than methods.
    pub fn build(self) -> Result<MoatKeeper, ConfigError> {
        let store = ConfigStore::new(self.resources, self.groups)?;

        let mut fallbacks = HashMap::new();
        for (id, fallback) in self.fallbacks {
            match &id {
                ResourceId::Method(_) => {
                    fallbacks.insert(id, fallback);
                }
                ResourceId::Group(name) => {
                    let members = store
                        .group(name)
                        .ok_or_else(|| ConfigError::Unsupported(id.clone()))?;
                    for member in members {
                        fallbacks
                            .entry(member.clone())
                            .or_insert_with(|| Arc::clone(&fallback));
                    }
                }
                _ => return Err(ConfigError::Unsupported(id)),
            }
        }

        let guard = self
            .creation_guard
            .unwrap_or_else(|| Arc::new(MaxValuesPerArg { max: self.max_values_per_arg }));

        let internals = Internals {
            store,
            registry: ClusterRegistry::new(self.cluster_listeners),
            parts: EngineParts {
                registry: self.registry,
                classifier: self.failure_classifier,
                callbacks: self.callbacks,
            },
            guard,
            listeners: Arc::from(self.invocation_listeners),
            fallbacks,
        };
        Ok(MoatKeeper::from_internals(internals))
    }
}

impl Default for MoatKeeperBuilder {
    fn default() -> Self {
        Self::new()
    }
}
