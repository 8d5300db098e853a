//! Time-bounded, exclusive, renewable leases over named resources.
//!
//! A [`Lease`] grants one holder exclusive use of one [`Leasable`] resource
//! until it expires. Expiry is a signal, not preemption: when the timer fires
//! the resource becomes eligible for re-grant, but a holder that is still
//! working is not interrupted. Holders that care can watch
//! [`Lease::expired`] and stop early, or call [`Lease::extend`] to push the
//! deadline out. At any instant at most one holder *believes* it holds a
//! resource; an expired holder may still be running.
//!
//! Brokers ([`LeaseBroker`]) decide which resource to grant next. The
//! scheduling policy every broker follows is captured by
//! [`select_least_recently_released`].

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Errors raised by leases and lease brokers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// A lease was requested for a zero or negative duration.
    #[error("A lease cannot be granted for a zero or negative duration ({duration}).")]
    InvalidDuration {
        /// The rejected duration.
        duration: String,
    },

    /// `extend` was called with a negative duration.
    #[error("Lease cannot be extended by a negative timespan.")]
    NegativeExtension,

    /// `extend` was called after the lease expired.
    #[error("The lease cannot be extended.")]
    CannotExtend,

    /// Leases arm their expiry timer on the current Tokio runtime.
    #[error("Leases require a running Tokio runtime.")]
    NoRuntime,

    /// The broker backing the lease failed.
    #[error("Lease broker error: {0}")]
    Broker(String),
}

/// A resource that can be leased, with its scheduling history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leasable<R> {
    /// The resource itself.
    pub resource: R,
    /// Unique name within the pool.
    pub name: String,
    /// When a lease on this resource was last granted.
    pub lease_last_granted: Option<DateTime<Utc>>,
    /// When a lease on this resource was last released.
    pub lease_last_released: Option<DateTime<Utc>>,
}

impl<R> Leasable<R> {
    /// A resource that has never been leased.
    pub fn new(name: impl Into<String>, resource: R) -> Self {
        Self {
            resource,
            name: name.into(),
            lease_last_granted: None,
            lease_last_released: None,
        }
    }

    /// Whether this resource is outside its post-release cooldown at `now`.
    #[must_use]
    pub fn is_cooled_down(&self, now: DateTime<Utc>, cooldown: TimeDelta) -> bool {
        self.lease_last_released
            .is_none_or(|released| released + cooldown < now)
    }
}

/// Pick the next resource to grant.
///
/// Among resources that are not held and whose last release is more than
/// `cooldown` before `now`, returns the index of the least recently released
/// one. Resources never released come first; ties keep pool order.
pub fn select_least_recently_released<R>(
    resources: &[Leasable<R>],
    is_held: impl Fn(&Leasable<R>) -> bool,
    now: DateTime<Utc>,
    cooldown: TimeDelta,
) -> Option<usize> {
    resources
        .iter()
        .enumerate()
        .filter(|(_, candidate)| !is_held(candidate) && candidate.is_cooled_down(now, cooldown))
        .min_by_key(|(_, candidate)| candidate.lease_last_released)
        .map(|(index, _)| index)
}

/// Hook run before a lease's deadline moves, so a broker can persist the
/// extension.
pub trait LeaseExtender: Send + Sync {
    /// Record that lease `lease_id` on `resource_name` was extended by `by`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] if the extension cannot be recorded; the lease
    /// deadline is then left unchanged.
    fn extend<'a>(
        &'a self,
        lease_id: Uuid,
        resource_name: &'a str,
        by: TimeDelta,
    ) -> BoxFuture<'a, Result<(), LeaseError>>;
}

/// Grants leases over a pool of resources.
pub trait LeaseBroker<R>: Send + Sync {
    /// Number of resources in the pool.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Broker`] if the pool cannot be inspected.
    fn pool_size(&self) -> BoxFuture<'_, Result<usize, LeaseError>>;

    /// Grant a lease on the least recently released eligible resource, or
    /// `None` if every resource is held or cooling down.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] on invalid durations or broker failures.
    fn acquire(
        &self,
        duration: TimeDelta,
        cooldown: TimeDelta,
    ) -> BoxFuture<'_, Result<Option<Lease<R>>, LeaseError>>;

    /// Release `lease`, recording the release time on its resource.
    ///
    /// Releasing a lease whose resource has since been re-granted to another
    /// holder leaves the new holder's lease in place.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Broker`] if the release cannot be recorded.
    fn release<'a>(&'a self, lease: &'a Lease<R>) -> BoxFuture<'a, Result<(), LeaseError>>;
}

/// A type-erased, shareable lease broker.
pub type SharedLeaseBroker<R> = Arc<dyn LeaseBroker<R>>;

struct Timing {
    duration: TimeDelta,
    deadline: Instant,
}

/// State shared between a lease and its expiry timer.
struct ExpiryClock {
    timing: Mutex<Timing>,
    expired: watch::Sender<bool>,
}

impl ExpiryClock {
    fn timing(&self) -> std::sync::MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self) -> bool {
        *self.expired.borrow()
    }

    async fn run(self: Arc<Self>) {
        loop {
            let deadline = self.timing().deadline;
            tokio::time::sleep_until(deadline).await;

            let timing = self.timing();
            if self.is_expired() {
                return;
            }
            if Instant::now() >= timing.deadline {
                self.expired.send_replace(true);
                return;
            }
        }
    }
}

struct LeaseInner<R> {
    id: Uuid,
    resource: R,
    name: String,
    last_granted: Option<DateTime<Utc>>,
    last_released: Option<DateTime<Utc>>,
    clock: Arc<ExpiryClock>,
    timer: JoinHandle<()>,
    extender: Option<Arc<dyn LeaseExtender>>,
}

impl<R> Drop for LeaseInner<R> {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// An exclusive, time-bounded grant over one resource.
///
/// Clones share the same lease; the expiry timer stops when the last clone
/// is dropped.
pub struct Lease<R> {
    inner: Arc<LeaseInner<R>>,
}

impl<R> Clone for Lease<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("resource", &self.inner.resource)
            .field("duration", &self.duration())
            .field("expired", &self.is_expired())
            .finish_non_exhaustive()
    }
}

impl<R: Clone + Send + Sync + 'static> Lease<R> {
    /// Grant a lease on `leasable` for `duration`.
    ///
    /// The lease copies the resource's grant and release timestamps and arms
    /// its expiry timer on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::InvalidDuration`] for zero or negative durations
    /// and [`LeaseError::NoRuntime`] outside a Tokio runtime.
    pub fn grant(leasable: &Leasable<R>, duration: TimeDelta) -> Result<Self, LeaseError> {
        Self::build(Uuid::new_v4(), leasable, duration, None)
    }

    /// Grant a lease whose extensions are first recorded through `extender`.
    ///
    /// # Errors
    ///
    /// See [`Lease::grant`].
    pub fn grant_extendable(
        id: Uuid,
        leasable: &Leasable<R>,
        duration: TimeDelta,
        extender: Arc<dyn LeaseExtender>,
    ) -> Result<Self, LeaseError> {
        Self::build(id, leasable, duration, Some(extender))
    }

    fn build(
        id: Uuid,
        leasable: &Leasable<R>,
        duration: TimeDelta,
        extender: Option<Arc<dyn LeaseExtender>>,
    ) -> Result<Self, LeaseError> {
        let span = positive_duration(duration)?;
        let runtime = Handle::try_current().map_err(|_| LeaseError::NoRuntime)?;

        let clock = Arc::new(ExpiryClock {
            timing: Mutex::new(Timing {
                duration,
                deadline: Instant::now() + span,
            }),
            expired: watch::Sender::new(false),
        });
        let timer = runtime.spawn(Arc::clone(&clock).run());

        Ok(Self {
            inner: Arc::new(LeaseInner {
                id,
                resource: leasable.resource.clone(),
                name: leasable.name.clone(),
                last_granted: leasable.lease_last_granted,
                last_released: leasable.lease_last_released,
                clock,
                timer,
                extender,
            }),
        })
    }
}

impl<R> Lease<R> {
    /// Unique id of this grant.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The leased resource.
    #[must_use]
    pub fn resource(&self) -> &R {
        &self.inner.resource
    }

    /// Name of the leased resource.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// When the resource was granted, as recorded by the broker.
    #[must_use]
    pub fn last_granted(&self) -> Option<DateTime<Utc>> {
        self.inner.last_granted
    }

    /// When the resource was last released before this grant.
    #[must_use]
    pub fn last_released(&self) -> Option<DateTime<Utc>> {
        self.inner.last_released
    }

    /// Total duration, including extensions.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.inner.clock.timing().duration
    }

    /// Time left before expiry.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        if self.is_expired() {
            return Duration::ZERO;
        }
        self.inner
            .clock
            .timing()
            .deadline
            .saturating_duration_since(Instant::now())
    }

    /// Whether the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.inner.clock.is_expired()
    }

    /// Completes once the lease has expired.
    pub async fn expired(&self) {
        let mut expired = self.inner.clock.expired.subscribe();
        // the sender outlives this borrow
        let _ = expired.wait_for(|expired| *expired).await;
    }

    /// Expire the lease now.
    pub fn expire(&self) {
        let _timing = self.inner.clock.timing();
        self.inner.clock.expired.send_replace(true);
    }

    /// Push the deadline out by `by`, cumulatively with earlier extensions.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NegativeExtension`] if `by` is negative,
    /// [`LeaseError::CannotExtend`] if the lease has expired (or expires
    /// while the extension is being recorded), and whatever the broker's
    /// extender reports.
    pub async fn extend(&self, by: TimeDelta) -> Result<(), LeaseError> {
        if by < TimeDelta::zero() {
            return Err(LeaseError::NegativeExtension);
        }
        let span = by.to_std().map_err(|_| LeaseError::NegativeExtension)?;
        self.ensure_live()?;

        if let Some(extender) = &self.inner.extender {
            extender.extend(self.inner.id, &self.inner.name, by).await?;
        }

        let mut timing = self.inner.clock.timing();
        if self.is_expired() || Instant::now() >= timing.deadline {
            return Err(LeaseError::CannotExtend);
        }
        timing.duration += by;
        timing.deadline += span;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), LeaseError> {
        let timing = self.inner.clock.timing();
        if self.is_expired() || Instant::now() >= timing.deadline {
            return Err(LeaseError::CannotExtend);
        }
        Ok(())
    }
}

fn positive_duration(duration: TimeDelta) -> Result<Duration, LeaseError> {
    match duration.to_std() {
        Ok(span) if !span.is_zero() => Ok(span),
        _ => Err(LeaseError::InvalidDuration {
            duration: duration.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leasable(name: &str) -> Leasable<String> {
        Leasable::new(name, name.to_string())
    }

    #[tokio::test]
    async fn rejects_zero_and_negative_durations() {
        let resource = leasable("a");
        assert!(matches!(
            Lease::grant(&resource, TimeDelta::zero()),
            Err(LeaseError::InvalidDuration { .. })
        ));
        assert!(matches!(
            Lease::grant(&resource, TimeDelta::seconds(-1)),
            Err(LeaseError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn granting_outside_a_runtime_fails() {
        let result = Lease::grant(&leasable("a"), TimeDelta::seconds(1));
        assert_eq!(result.unwrap_err(), LeaseError::NoRuntime);
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_its_duration() {
        let start = Instant::now();
        let lease = Lease::grant(&leasable("a"), TimeDelta::seconds(10)).unwrap();
        assert!(!lease.is_expired());

        lease.expired().await;
        assert!(lease.is_expired());
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_millis(10_010));
        assert_eq!(lease.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn extensions_are_cumulative() {
        let start = Instant::now();
        let lease = Lease::grant(&leasable("a"), TimeDelta::seconds(10)).unwrap();

        lease.extend(TimeDelta::seconds(5)).await.unwrap();
        lease.extend(TimeDelta::seconds(5)).await.unwrap();
        assert_eq!(lease.duration(), TimeDelta::seconds(20));

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(!lease.is_expired());

        lease.expired().await;
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_millis(20_010));
    }

    #[tokio::test(start_paused = true)]
    async fn extending_an_expired_lease_fails() {
        let lease = Lease::grant(&leasable("a"), TimeDelta::milliseconds(100)).unwrap();
        lease.expired().await;

        let error = lease.extend(TimeDelta::seconds(1)).await.unwrap_err();
        assert_eq!(error, LeaseError::CannotExtend);
        assert_eq!(error.to_string(), "The lease cannot be extended.");

        let manual = Lease::grant(&leasable("b"), TimeDelta::minutes(1)).unwrap();
        manual.expire();
        assert_eq!(
            manual.extend(TimeDelta::seconds(1)).await,
            Err(LeaseError::CannotExtend)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn negative_extensions_are_rejected() {
        let lease = Lease::grant(&leasable("a"), TimeDelta::seconds(10)).unwrap();

        let error = lease.extend(TimeDelta::seconds(-1)).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Lease cannot be extended by a negative timespan."
        );
        assert_eq!(lease.duration(), TimeDelta::seconds(10));
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_expiry() {
        let lease = Lease::grant(&leasable("a"), TimeDelta::seconds(30)).unwrap();
        let holder = lease.clone();

        lease.expire();
        assert!(holder.is_expired());
        holder.expired().await;
    }

    struct CountingExtender {
        calls: AtomicUsize,
        fail: bool,
    }

    impl LeaseExtender for CountingExtender {
        fn extend<'a>(
            &'a self,
            _lease_id: Uuid,
            resource_name: &'a str,
            by: TimeDelta,
        ) -> BoxFuture<'a, Result<(), LeaseError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            let name = resource_name.to_string();
            Box::pin(async move {
                if fail {
                    return Err(LeaseError::Broker(format!("cannot extend {name} by {by}")));
                }
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn extender_failures_leave_the_deadline_alone() {
        let extender = Arc::new(CountingExtender {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let lease = Lease::grant_extendable(
            Uuid::new_v4(),
            &leasable("a"),
            TimeDelta::seconds(10),
            Arc::clone(&extender) as Arc<dyn LeaseExtender>,
        )
        .unwrap();

        assert!(matches!(
            lease.extend(TimeDelta::seconds(5)).await,
            Err(LeaseError::Broker(_))
        ));
        assert_eq!(extender.calls.load(Ordering::SeqCst), 1);
        assert_eq!(lease.duration(), TimeDelta::seconds(10));
    }

    #[test]
    fn selection_prefers_the_least_recently_released() {
        let now = Utc::now();
        let mut pool: Vec<Leasable<String>> = (0..10).map(|i| leasable(&format!("r{i}"))).collect();
        for resource in &mut pool {
            resource.lease_last_released = Some(now - TimeDelta::seconds(5));
        }
        pool[6].lease_last_released = Some(now - TimeDelta::milliseconds(5_100));

        let chosen = select_least_recently_released(&pool, |_| false, now, TimeDelta::seconds(1));
        assert_eq!(chosen, Some(6));
    }

    #[test]
    fn selection_puts_never_released_first_and_skips_held() {
        let now = Utc::now();
        let mut pool = vec![leasable("a"), leasable("b"), leasable("c")];
        pool[0].lease_last_released = Some(now - TimeDelta::hours(1));

        let chosen = select_least_recently_released(&pool, |_| false, now, TimeDelta::zero());
        assert_eq!(chosen, Some(1));

        let chosen = select_least_recently_released(
            &pool,
            |candidate| candidate.name != "a",
            now,
            TimeDelta::zero(),
        );
        assert_eq!(chosen, Some(0));
    }

    #[test]
    fn selection_respects_the_cooldown() {
        let now = Utc::now();
        let mut pool = vec![leasable("a"), leasable("b")];
        pool[0].lease_last_released = Some(now - TimeDelta::milliseconds(500));
        pool[1].lease_last_released = Some(now - TimeDelta::milliseconds(200));

        assert_eq!(
            select_least_recently_released(&pool, |_| false, now, TimeDelta::seconds(1)),
            None
        );
        assert_eq!(
            select_least_recently_released(&pool, |_| false, now, TimeDelta::milliseconds(300)),
            Some(0)
        );
    }
}
