//! Execution chain: admission, completion, retry and fallback around one call
//!
//! A chain covers every cluster an invocation touches: the method cluster
//! first, then one cluster per observed argument value. Admission walks the
//! clusters in that order and stops at the first rejection; the tickets taken
//! until then are dropped, releasing any held concurrency slots.

use crate::class::ClassRegistry;
use crate::cluster::MoatCluster;
use crate::config::SharedFallback;
use crate::errors::{BoxError, MoatError, NotPermitted};
use crate::fallback::Fallback;
use crate::handle::{Entered, RequestHandle, SharedListeners};
use crate::resource::ResourceId;
use crate::retry::RetryExecutor;
use std::sync::Arc;

/// Clusters guarding one invocation
pub struct ExecutionChain {
    resource: ResourceId,
    clusters: Vec<Arc<MoatCluster>>,
    registry: ClassRegistry,
    listeners: SharedListeners,
}

impl ExecutionChain {
    /// `clusters` are admitted in the given order
    pub fn new(
        resource: ResourceId,
        clusters: Vec<Arc<MoatCluster>>,
        registry: ClassRegistry,
        listeners: SharedListeners,
    ) -> Self {
        Self {
            resource,
            clusters,
            registry,
            listeners,
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn clusters(&self) -> &[Arc<MoatCluster>] {
        &self.clusters
    }

    /// Retry executor of the most specific cluster that has one
    pub fn retry(&self) -> Option<Arc<RetryExecutor>> {
        self.clusters.iter().rev().find_map(|c| c.retry())
    }

    fn admit(&self) -> Result<Entered, NotPermitted> {
        let mut entered = Vec::new();
        for cluster in &self.clusters {
            entered.extend(cluster.try_enter_all()?);
        }
        Ok(entered)
    }

    /// Admit a call the caller runs and completes itself
    ///
    /// A rejected call yields a handle that is already ended; when a fallback
    /// is configured for the rejecting resource its result is computed right
    /// away and kept on the handle.
    pub fn try_to_execute<A, T>(&self, args: &A) -> RequestHandle<T>
    where
        A: 'static,
        T: 'static,
    {
        self.try_to_execute_with(args, None)
    }

    /// [`try_to_execute`](Self::try_to_execute) with a call-site fallback
    /// taking precedence over configured ones
    pub fn try_to_execute_with<A, T>(
        &self,
        args: &A,
        fallback: Option<&Fallback<A, T>>,
    ) -> RequestHandle<T>
    where
        A: 'static,
        T: 'static,
    {
        match self.admit() {
            Ok(entered) => {
                RequestHandle::admitted(self.resource.clone(), entered, Arc::clone(&self.listeners))
            }
            Err(rejection) => {
                let cause = MoatError::NotPermitted(rejection.clone());
                let computed = self.recover_with(cause, args, fallback).ok();
                RequestHandle::rejected(
                    self.resource.clone(),
                    rejection,
                    computed,
                    Arc::clone(&self.listeners),
                )
            }
        }
    }

    /// Run `call` under the chain's protection, with retry and fallback
    pub fn execute<A, T, F>(
        &self,
        args: &A,
        mut call: F,
        fallback: Option<&Fallback<A, T>>,
    ) -> Result<T, MoatError>
    where
        A: 'static,
        T: 'static,
        F: FnMut(&A) -> Result<T, BoxError>,
    {
        let outcome = match self.retry() {
            Some(retry) => retry.execute(|_| self.run_once(args, &mut call)),
            None => self.run_once(args, &mut call),
        };
        outcome.or_else(|cause| self.recover_with(cause, args, fallback).unwrap_or_else(Err))
    }

    /// One admission + call + completion cycle
    fn run_once<A, T, F>(&self, args: &A, call: &mut F) -> Result<T, MoatError>
    where
        T: 'static,
        F: FnMut(&A) -> Result<T, BoxError>,
    {
        let entered = self.admit()?;
        let handle: RequestHandle<T> =
            RequestHandle::admitted(self.resource.clone(), entered, Arc::clone(&self.listeners));
        match call(args) {
            Ok(value) => {
                handle.end_with_result(&value)?;
                Ok(value)
            }
            Err(err) => {
                handle.end_with_error(&*err)?;
                Err(MoatError::Business(err))
            }
        }
    }

    /// Apply the call-site fallback, or the one configured for the resource
    /// that caused the failure
    ///
    /// `Err(cause)` means no fallback was found for the cause; `Ok(result)`
    /// is the fallback's own outcome.
    fn recover_with<A, T>(
        &self,
        cause: MoatError,
        args: &A,
        fallback: Option<&Fallback<A, T>>,
    ) -> Result<Result<T, MoatError>, MoatError>
    where
        A: 'static,
        T: 'static,
    {
        if let Some(fallback) = fallback {
            return Ok(fallback.apply(cause, args, &self.registry));
        }
        let Some(shared) = self.configured_fallback(&cause) else {
            return Err(cause);
        };
        match shared.downcast_ref::<Fallback<A, T>>() {
            Some(fallback) => Ok(fallback.apply(cause, args, &self.registry)),
            None => {
                tracing::warn!(
                    resource = %self.resource,
                    "configured fallback does not match the call signature"
                );
                Err(cause)
            }
        }
    }

    fn configured_fallback(&self, cause: &MoatError) -> Option<SharedFallback> {
        let rejection = match cause {
            MoatError::NotPermitted(rejection) => Some(rejection),
            MoatError::RetryExhausted { last, .. } => last.not_permitted(),
            _ => None,
        };
        if let Some(rejection) = rejection
            && let Some(cluster) = self.clusters.iter().find(|c| c.resource() == &rejection.resource)
            && let Some(moat) = cluster.get(rejection.kind)
            && let Some(shared) = moat.config().fallback.clone()
        {
            return Some(shared);
        }
        self.clusters.iter().find_map(|c| c.config().fallback.clone())
    }
}

impl std::fmt::Debug for ExecutionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resources: Vec<&ResourceId> = self.clusters.iter().map(|c| c.resource()).collect();
        f.debug_struct("ExecutionChain")
            .field("resource", &self.resource)
            .field("clusters", &resources)
            .finish()
    }
}
