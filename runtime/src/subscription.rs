//! Subscribers and the subscriptions catchups keep for them.
//!
//! A [`Subscriber`] bundles an aggregator, the projection store its state
//! lives in and an optional error handler. Subscribing it to a catchup erases
//! the projection type, so one catchup can feed projections of different
//! types from the same batches.
//!
//! For each batch, a subscription loads its projection, drops items the
//! projection's cursor already covers, aggregates the rest, then stores the
//! new value together with the advanced cursor. A failing aggregation leaves
//! the stored projection untouched.

use crate::CatchupError;
use crate::metrics::CatchupMetrics;
use alluvial_core::aggregator::{Aggregator, SharedAggregator};
use alluvial_core::cursor::{Cursor, CursorPosition};
use alluvial_core::projection::{
    InMemoryProjectionStore, Projection, ProjectionStore, SharedProjectionStore,
};
use alluvial_core::stream::Batch;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// An aggregation failure offered to a subscriber's error handler.
pub struct AggregationFailure {
    stream_id: String,
    error: anyhow::Error,
    handled: bool,
}

impl AggregationFailure {
    fn new(stream_id: &str, error: anyhow::Error) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            error,
            handled: false,
        }
    }

    /// Id of the stream whose batch failed.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The aggregator's error.
    #[must_use]
    pub const fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Swallow the failure. The projection stays where it was and the
    /// catchup carries on with other subscribers and streams.
    pub const fn continue_catchup(&mut self) {
        self.handled = true;
    }

    /// Whether [`continue_catchup`](Self::continue_catchup) was called.
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        self.handled
    }
}

impl fmt::Debug for AggregationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationFailure")
            .field("stream_id", &self.stream_id)
            .field("error", &format_args!("{:#}", self.error))
            .field("handled", &self.handled)
            .finish()
    }
}

type ErrorHandler = Arc<dyn Fn(&mut AggregationFailure) + Send + Sync>;

/// An aggregator and its projection store, ready to subscribe to a catchup.
pub struct Subscriber<V, D, P> {
    name: String,
    aggregator: SharedAggregator<V, D, P>,
    store: SharedProjectionStore<V, P>,
    on_error: Option<ErrorHandler>,
}

impl<V, D, P> Subscriber<V, D, P>
where
    V: Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
{
    /// Subscribe `aggregator`, keeping projections in `store`.
    pub fn new<A>(aggregator: A, store: SharedProjectionStore<V, P>) -> Self
    where
        A: Aggregator<V, D, P> + 'static,
    {
        Self {
            name: std::any::type_name::<V>().to_string(),
            aggregator: Arc::new(aggregator),
            store,
            on_error: None,
        }
    }

    /// Subscribe `aggregator` with a fresh in-memory store, returning a
    /// handle to that store alongside.
    pub fn in_memory<A>(aggregator: A) -> (Self, InMemoryProjectionStore<V, P>)
    where
        A: Aggregator<V, D, P> + 'static,
        V: Clone + Default,
    {
        let store = InMemoryProjectionStore::new();
        let subscriber = Self::new(aggregator, Arc::new(store.clone()));
        (subscriber, store)
    }

    /// Name used in logs. Defaults to the projection type name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Handle aggregation failures. Failures the handler does not mark with
    /// [`AggregationFailure::continue_catchup`] stop the catchup run.
    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&mut AggregationFailure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

/// A subscriber with its projection type erased.
pub(crate) trait Subscription<D, P>: Send + Sync {
    /// Where the projection stored under `key` stands, with fresh
    /// projections placed at `origin`.
    fn cursor<'a>(
        &'a self,
        key: &'a str,
        origin: &'a Cursor<P>,
    ) -> BoxFuture<'a, Result<Cursor<P>, CatchupError>>;

    /// Apply `batch` to the projection stored under `key`, returning how
    /// many items were aggregated.
    fn apply<'a>(
        &'a self,
        key: &'a str,
        batch: Arc<Batch<D, P>>,
        origin: &'a Cursor<P>,
    ) -> BoxFuture<'a, Result<usize, CatchupError>>;
}

fn resume_from<P: CursorPosition>(stored: Cursor<P>, origin: &Cursor<P>) -> Cursor<P> {
    if stored.position().is_none() {
        origin.clone()
    } else {
        stored
    }
}

impl<V, D, P> Subscription<D, P> for Subscriber<V, D, P>
where
    V: Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
{
    fn cursor<'a>(
        &'a self,
        key: &'a str,
        origin: &'a Cursor<P>,
    ) -> BoxFuture<'a, Result<Cursor<P>, CatchupError>> {
        Box::pin(async move {
            let projection = self.store.get(key).await?;
            Ok(resume_from(projection.cursor, origin))
        })
    }

    fn apply<'a>(
        &'a self,
        key: &'a str,
        batch: Arc<Batch<D, P>>,
        origin: &'a Cursor<P>,
    ) -> BoxFuture<'a, Result<usize, CatchupError>> {
        Box::pin(async move {
            let Projection { value, cursor } = self.store.get(key).await?;
            let mut cursor = resume_from(cursor, origin);

            let pending = Batch::prune(&batch, &cursor);
            let Some(end) = pending.end_position().cloned() else {
                return Ok(0);
            };
            let items = pending.len();

            match self.aggregator.aggregate(value, pending).await {
                Ok(value) => {
                    cursor.advance_to(end)?;
                    self.store
                        .put(key, Projection::with_cursor(value, cursor))
                        .await?;
                    Ok(items)
                }
                Err(error) => {
                    CatchupMetrics::record_aggregation_error();
                    let mut failure = AggregationFailure::new(key, error);
                    if let Some(handler) = &self.on_error {
                        handler(&mut failure);
                    }

                    if failure.is_handled() {
                        tracing::warn!(
                            subscriber = %self.name,
                            stream_id = %key,
                            error = %format!("{:#}", failure.error),
                            "Aggregation failed, continuing"
                        );
                        Ok(0)
                    } else {
                        Err(CatchupError::aggregation(key, &failure.error))
                    }
                }
            }
        })
    }
}

pub(crate) type SharedSubscription<D, P> = Arc<dyn Subscription<D, P>>;

/// Removes a subscription by id without knowing its stream types.
trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64) -> bool;
}

/// The subscriptions a catchup feeds. Shared between the partitions of a
/// distributed catchup.
pub(crate) struct SubscriptionRegistry<D, P> {
    entries: RwLock<Vec<(u64, SharedSubscription<D, P>)>>,
    next_id: AtomicU64,
}

impl<D, P> SubscriptionRegistry<D, P>
where
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn subscribe<V>(self: &Arc<Self>, subscriber: Subscriber<V, D, P>) -> SubscriptionHandle
    where
        V: Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subscriber = %subscriber.name, id, "Subscribed");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(subscriber)));

        let erased: Arc<dyn Unsubscribe> = Arc::clone(self) as Arc<dyn Unsubscribe>;
        SubscriptionHandle {
            id,
            registry: Arc::downgrade(&erased),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SharedSubscription<D, P>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, subscription)| Arc::clone(subscription))
            .collect()
    }
}

impl<D, P> Unsubscribe for SubscriptionRegistry<D, P>
where
    D: Send + Sync,
    P: Send + Sync,
{
    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }
}

/// Returned by `subscribe`. Dropping it keeps the subscription active; only
/// [`SubscriptionHandle::unsubscribe`] removes it.
#[derive(Clone)]
#[must_use = "dropping the handle keeps the subscription; call `unsubscribe` to remove it"]
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<dyn Unsubscribe>,
}

impl SubscriptionHandle {
    /// Stop feeding this subscriber. Returns `false` if it was already
    /// removed or its catchup is gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use alluvial_core::aggregator;

    fn batch(items: &[(i64, i64)]) -> Arc<Batch<i64, i64>> {
        Arc::new(Batch::new(None, items.to_vec()))
    }

    fn summing() -> (Subscriber<i64, i64, i64>, InMemoryProjectionStore<i64, i64>) {
        Subscriber::in_memory(aggregator::fold(|total: i64, n: &i64| total + n))
    }

    #[tokio::test]
    async fn apply_advances_the_cursor_and_stores_the_value() {
        let (subscriber, store) = summing();

        let applied = subscriber
            .apply("s", batch(&[(1, 10), (2, 20)]), &Cursor::new())
            .await
            .unwrap();

        assert_eq!(applied, 2);
        let stored = store.find("s").await.unwrap();
        assert_eq!(stored.value, 30);
        assert_eq!(stored.cursor.position(), Some(&2));
    }

    #[tokio::test]
    async fn apply_skips_items_the_projection_already_has() {
        let (subscriber, store) = summing();
        store
            .put("s", Projection::with_cursor(100, Cursor::at(2)))
            .await
            .unwrap();

        let applied = subscriber
            .apply("s", batch(&[(1, 1), (2, 2), (3, 3)]), &Cursor::new())
            .await
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(store.find("s").await.unwrap().value, 103);
    }

    #[tokio::test]
    async fn unhandled_failures_leave_the_projection_alone() {
        let store = InMemoryProjectionStore::<i64, i64>::new();
        let subscriber = Subscriber::<i64, i64, i64>::new(
            aggregator::try_fold(|_: i64, _: &i64| Err(anyhow::anyhow!("boom"))),
            Arc::new(store.clone()),
        );

        let error = subscriber
            .apply("s", batch(&[(1, 1)]), &Cursor::new())
            .await
            .unwrap_err();

        assert_eq!(error.to_string(), "Aggregation failed for s: boom");
        assert!(store.find("s").await.is_none());
    }

    #[tokio::test]
    async fn handled_failures_are_swallowed() {
        let store = InMemoryProjectionStore::<i64, i64>::new();
        let subscriber = Subscriber::<i64, i64, i64>::new(
            aggregator::try_fold(|_: i64, _: &i64| Err(anyhow::anyhow!("boom"))),
            Arc::new(store.clone()),
        )
        .on_error(|failure| {
            assert_eq!(failure.stream_id(), "s");
            failure.continue_catchup();
        });

        let applied = subscriber
            .apply("s", batch(&[(1, 1)]), &Cursor::new())
            .await
            .unwrap();

        assert_eq!(applied, 0);
        assert!(store.find("s").await.is_none());
    }

    #[tokio::test]
    async fn fresh_projections_start_at_the_origin() {
        let (subscriber, _store) = summing();
        let origin = Cursor::at(50).descending();

        let cursor = subscriber.cursor("s", &origin).await.unwrap();
        assert_eq!(cursor, origin);
    }

    #[test]
    fn unsubscribe_removes_only_once() {
        let registry = SubscriptionRegistry::<i64, i64>::new();
        let (first, _) = summing();
        let (second, _) = summing();

        let handle = registry.subscribe(first);
        let _ = registry.subscribe(second);
        assert_eq!(registry.snapshot().len(), 2);

        assert!(handle.clone().unsubscribe());
        assert!(!handle.unsubscribe());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn dropping_a_handle_keeps_the_subscription() {
        let registry = SubscriptionRegistry::<i64, i64>::new();
        let (subscriber, _) = summing();
        let handle = registry.subscribe(subscriber);

        drop(handle);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn handles_outliving_their_registry_do_nothing() {
        let registry = SubscriptionRegistry::<i64, i64>::new();
        let (subscriber, _) = summing();
        let handle = registry.subscribe(subscriber);

        drop(registry);
        assert!(!handle.unsubscribe());
    }
}
