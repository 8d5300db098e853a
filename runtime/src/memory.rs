//! In-memory lease pools.
//!
//! A [`LeaseRegistry`] holds named pools of leasable resources together with
//! the leases currently out on them. Distributors in the same process share a
//! pool by sharing the registry: each gets its own [`InMemoryLeaseBroker`]
//! over the same pool name, and the registry's lock makes "pick a free
//! resource and mark it held" a single step.

use alluvial_core::environment::{Clock, SystemClock};
use alluvial_core::lease::{Leasable, Lease, LeaseBroker, LeaseError, select_least_recently_released};
use alluvial_core::{BoxFuture, TimeDelta};
use futures::FutureExt;
use futures::future;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct PoolState<R> {
    resources: Vec<Leasable<R>>,
    in_progress: HashMap<String, Lease<R>>,
}

impl<R> Default for PoolState<R> {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            in_progress: HashMap::new(),
        }
    }
}

impl<R> PoolState<R> {
    fn is_held(&self, name: &str) -> bool {
        self.in_progress
            .get(name)
            .is_some_and(|lease| !lease.is_expired())
    }
}

/// Named pools of leasable resources, shared by every broker built on it.
///
/// Clones share the same pools.
pub struct LeaseRegistry<R> {
    pools: Arc<Mutex<HashMap<String, PoolState<R>>>>,
}

impl<R> Clone for LeaseRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            pools: Arc::clone(&self.pools),
        }
    }
}

impl<R> Default for LeaseRegistry<R> {
    fn default() -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<R: Clone> LeaseRegistry<R> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PoolState<R>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `resources` to `pool`, creating it if needed. Resources whose
    /// name is already in the pool are ignored, so every broker can register
    /// the full list.
    pub fn register_pool(&self, pool: &str, resources: impl IntoIterator<Item = Leasable<R>>) {
        let mut pools = self.lock();
        let state = pools.entry(pool.to_string()).or_default();
        for resource in resources {
            if !state.resources.iter().any(|known| known.name == resource.name) {
                state.resources.push(resource);
            }
        }
    }

    /// Copies of the resources in `pool`, with their grant and release
    /// times.
    #[must_use]
    pub fn snapshot(&self, pool: &str) -> Vec<Leasable<R>> {
        self.lock()
            .get(pool)
            .map(|state| state.resources.clone())
            .unwrap_or_default()
    }

    /// Whether `resource` in `pool` is leased and its lease has not expired.
    #[must_use]
    pub fn is_held(&self, pool: &str, resource: &str) -> bool {
        self.lock()
            .get(pool)
            .is_some_and(|state| state.is_held(resource))
    }
}

/// A [`LeaseBroker`] over one pool of a [`LeaseRegistry`].
pub struct InMemoryLeaseBroker<R> {
    registry: LeaseRegistry<R>,
    pool: String,
    clock: Arc<dyn Clock>,
}

impl<R> InMemoryLeaseBroker<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// A broker over `pool`, registering `resources` into it.
    pub fn new(
        registry: &LeaseRegistry<R>,
        pool: impl Into<String>,
        resources: impl IntoIterator<Item = Leasable<R>>,
    ) -> Self {
        let pool = pool.into();
        registry.register_pool(&pool, resources);
        Self {
            registry: registry.clone(),
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Read grant and release times from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Name of the pool this broker leases from.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    fn try_acquire(&self, duration: TimeDelta, cooldown: TimeDelta) -> Result<Option<Lease<R>>, LeaseError> {
        let now = self.clock.now();
        let mut pools = self.registry.lock();
        let Some(state) = pools.get_mut(&self.pool) else {
            return Ok(None);
        };

        let Some(index) = select_least_recently_released(
            &state.resources,
            |candidate| state.is_held(&candidate.name),
            now,
            cooldown,
        ) else {
            return Ok(None);
        };

        let mut granted = state.resources[index].clone();
        granted.lease_last_granted = Some(now);
        let lease = Lease::grant(&granted, duration)?;

        tracing::debug!(pool = %self.pool, resource = %granted.name, "Lease granted");
        state.in_progress.insert(granted.name.clone(), lease.clone());
        state.resources[index] = granted;
        Ok(Some(lease))
    }

    fn finish(&self, lease: &Lease<R>) {
        let now = self.clock.now();
        let mut pools = self.registry.lock();
        let Some(state) = pools.get_mut(&self.pool) else {
            return;
        };

        let current = state
            .in_progress
            .get(lease.name())
            .is_some_and(|held| held.id() == lease.id());
        if !current {
            tracing::debug!(
                pool = %self.pool,
                resource = %lease.name(),
                "Lease was superseded, ignoring release"
            );
            return;
        }

        state.in_progress.remove(lease.name());
        if let Some(resource) = state
            .resources
            .iter_mut()
            .find(|resource| resource.name == lease.name())
        {
            resource.lease_last_released = Some(now);
        }
        tracing::debug!(pool = %self.pool, resource = %lease.name(), "Lease released");
    }
}

impl<R> LeaseBroker<R> for InMemoryLeaseBroker<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn pool_size(&self) -> BoxFuture<'_, Result<usize, LeaseError>> {
        let size = self
            .registry
            .lock()
            .get(&self.pool)
            .map_or(0, |state| state.resources.len());
        future::ready(Ok(size)).boxed()
    }

    fn acquire(
        &self,
        duration: TimeDelta,
        cooldown: TimeDelta,
    ) -> BoxFuture<'_, Result<Option<Lease<R>>, LeaseError>> {
        future::ready(self.try_acquire(duration, cooldown)).boxed()
    }

    fn release<'a>(&'a self, lease: &'a Lease<R>) -> BoxFuture<'a, Result<(), LeaseError>> {
        self.finish(lease);
        future::ready(Ok(())).boxed()
    }
}
