//! Single-stream catchup.
//!
//! A [`StreamCatchup`] fetches one batch at a time from its stream. Its
//! subscriptions are grouped by the cursor their projections stand at, and
//! each group gets its own batch from that cursor. A subscriber stuck on a
//! failure it chose to skip therefore never holds the others back, and
//! subscribers that joined at different times never double-apply an item.
//!
//! Runs are single-flight: a [`Catchup::run_single_batch`] call made while
//! another is in flight returns a skipped [`BatchOutcome`] straight away.

use crate::CatchupError;
use crate::metrics::CatchupMetrics;
use crate::poll::PollHandle;
use crate::subscription::{SharedSubscription, Subscriber, SubscriptionHandle, SubscriptionRegistry};
use alluvial_core::cursor::{Cursor, CursorPosition};
use alluvial_core::stream::{Query, SharedStream, Stream};
use futures::future::{self, BoxFuture};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// What a single batch run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Items fetched from the stream (upstream items for multi-stream
    /// catchups).
    pub fetched: usize,
    /// Items aggregated into projections, summed over subscriptions.
    pub applied: usize,
    /// Another run was already in flight, so nothing was done.
    pub skipped: bool,
}

impl BatchOutcome {
    /// The outcome of a run that found another one in flight.
    #[must_use]
    pub const fn skipped() -> Self {
        Self {
            fetched: 0,
            applied: 0,
            skipped: true,
        }
    }
}

/// A catchup that can be driven one batch at a time.
pub trait Catchup: Send + Sync {
    /// Fetch and apply one batch.
    ///
    /// # Errors
    ///
    /// Fetch and store failures, and aggregation failures no error handler
    /// marked as handled. Subscriptions that did not fail still keep what
    /// they applied.
    fn run_single_batch(&self) -> BoxFuture<'_, Result<BatchOutcome, CatchupError>>;

    /// Run batches until one applies nothing, returning the total applied.
    ///
    /// On an endless stream this returns as soon as a batch comes back
    /// empty, not when the stream is exhausted. Subscribers that keep
    /// failing with handled errors apply nothing, so they do not keep this
    /// loop alive.
    ///
    /// # Errors
    ///
    /// The first error from [`run_single_batch`](Self::run_single_batch).
    fn run_until_caught_up(&self) -> BoxFuture<'_, Result<usize, CatchupError>> {
        Box::pin(async move {
            let mut total = 0;
            loop {
                let outcome = self.run_single_batch().await?;
                total += outcome.applied;
                if outcome.skipped || outcome.applied == 0 {
                    return Ok(total);
                }
            }
        })
    }

    /// Run [`run_until_caught_up`](Self::run_until_caught_up) in the
    /// background, sleeping `interval` between cycles.
    fn poll(self: Arc<Self>, interval: Duration) -> PollHandle
    where
        Self: Sized + 'static,
    {
        PollHandle::spawn(self, interval)
    }
}

/// Clears the in-flight flag when a run finishes, fails or is dropped.
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct StreamOutcome {
    pub(crate) fetched: usize,
    pub(crate) applied: usize,
    /// Some fetch came back with a full batch, so more may be waiting.
    pub(crate) full: bool,
}

type CursorGroup<D, P> = (Cursor<P>, Vec<SharedSubscription<D, P>>);

/// Group subscriptions whose projections stand at the same cursor.
fn group_by_cursor<D, P>(
    cursors: Vec<Cursor<P>>,
    subscriptions: &[SharedSubscription<D, P>],
) -> Vec<CursorGroup<D, P>>
where
    P: CursorPosition,
{
    let mut groups: Vec<CursorGroup<D, P>> = Vec::new();
    for (cursor, subscription) in cursors.into_iter().zip(subscriptions) {
        match groups.iter_mut().find(|(start, _)| *start == cursor) {
            Some((_, members)) => members.push(Arc::clone(subscription)),
            None => groups.push((cursor, vec![Arc::clone(subscription)])),
        }
    }
    groups
}

/// Fetch one batch of `stream` for `subscriptions` and apply it to each.
///
/// Subscriptions standing at the same cursor share a fetch from there, so a
/// subscription that keeps failing only ever re-reads its own window. Every
/// group runs even when another fails; the first failure is returned once
/// all have run.
pub(crate) async fn catch_up_stream<D, P>(
    stream: &dyn Stream<Data = D, Position = P>,
    subscriptions: &[SharedSubscription<D, P>],
    batch_size: Option<usize>,
) -> Result<StreamOutcome, CatchupError>
where
    D: Send + Sync + 'static,
    P: CursorPosition,
{
    let key = stream.id();
    let origin = stream.new_cursor();

    let cursors = future::try_join_all(
        subscriptions
            .iter()
            .map(|subscription| subscription.cursor(key, &origin)),
    )
    .await?;
    let groups = group_by_cursor(cursors, subscriptions);

    let results = future::join_all(
        groups
            .into_iter()
            .map(|(start, members)| catch_up_group(stream, start, members, batch_size, &origin)),
    )
    .await;

    let mut total = StreamOutcome::default();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(outcome) => {
                total.fetched += outcome.fetched;
                total.applied += outcome.applied;
                total.full |= outcome.full;
            }
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    first_error.map_or(Ok(total), Err)
}

async fn catch_up_group<D, P>(
    stream: &dyn Stream<Data = D, Position = P>,
    start: Cursor<P>,
    members: Vec<SharedSubscription<D, P>>,
    batch_size: Option<usize>,
    origin: &Cursor<P>,
) -> Result<StreamOutcome, CatchupError>
where
    D: Send + Sync + 'static,
    P: CursorPosition,
{
    let key = stream.id();
    let mut query = Query::new(start);
    if let Some(size) = batch_size {
        query = query.with_batch_size(size);
    }

    let batch = Arc::new(stream.fetch(&mut query).await?);
    if batch.is_empty() {
        return Ok(StreamOutcome::default());
    }

    let results = future::join_all(
        members
            .iter()
            .map(|subscription| subscription.apply(key, Arc::clone(&batch), origin)),
    )
    .await;

    let mut applied = 0;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(items) => applied += items,
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(StreamOutcome {
            fetched: batch.len(),
            applied,
            full: batch_size.is_some_and(|size| batch.len() >= size),
        }),
    }
}

/// Catches projections up with a single stream.
///
/// Projections are keyed by the stream id in their stores.
pub struct StreamCatchup<D, P> {
    stream: SharedStream<D, P>,
    subscriptions: Arc<SubscriptionRegistry<D, P>>,
    batch_size: Option<usize>,
    running: AtomicBool,
}

impl<D, P> StreamCatchup<D, P>
where
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
{
    /// A catchup over `stream` with no subscribers yet.
    #[must_use]
    pub fn new(stream: SharedStream<D, P>) -> Self {
        Self::with_registry(stream, SubscriptionRegistry::new())
    }

    pub(crate) fn with_registry(
        stream: SharedStream<D, P>,
        subscriptions: Arc<SubscriptionRegistry<D, P>>,
    ) -> Self {
        Self {
            stream,
            subscriptions,
            batch_size: None,
            running: AtomicBool::new(false),
        }
    }

    /// Limit how many items each batch fetches.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Feed `subscriber` from the next batch onwards.
    pub fn subscribe<V>(&self, subscriber: Subscriber<V, D, P>) -> SubscriptionHandle
    where
        V: Send + Sync + 'static,
    {
        self.subscriptions.subscribe(subscriber)
    }

    /// Id of the stream being caught up.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        self.stream.id()
    }

    #[tracing::instrument(skip(self), fields(stream_id = %self.stream.id()))]
    async fn run_batch(&self) -> Result<BatchOutcome, CatchupError> {
        let Some(_running) = RunGuard::try_acquire(&self.running) else {
            tracing::debug!("Batch already in flight, skipping");
            return Ok(BatchOutcome::skipped());
        };

        let subscriptions = self.subscriptions.snapshot();
        if subscriptions.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let started = Instant::now();
        let outcome = catch_up_stream(&*self.stream, &subscriptions, self.batch_size).await?;
        if outcome.fetched > 0 {
            CatchupMetrics::record_batch(outcome.applied, started.elapsed());
        }

        tracing::debug!(
            fetched = outcome.fetched,
            applied = outcome.applied,
            "Batch complete"
        );
        Ok(BatchOutcome {
            fetched: outcome.fetched,
            applied: outcome.applied,
            skipped: false,
        })
    }
}

impl<D, P> Catchup for StreamCatchup<D, P>
where
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
{
    fn run_single_batch(&self) -> BoxFuture<'_, Result<BatchOutcome, CatchupError>> {
        Box::pin(self.run_batch())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use alluvial_core::aggregator::{self, AggregatorExt, Next};
    use alluvial_core::projection::{InMemoryProjectionStore, Projection, ProjectionStore};
    use alluvial_core::stream::{Batch, FnStream, StreamOps};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn numbers(items: Arc<Mutex<Vec<i64>>>) -> SharedStream<i64, i64> {
        FnStream::create("numbers", move |query: Query<i64>| {
            let items = Arc::clone(&items);
            async move {
                let from = usize::try_from(query.cursor().position().copied().unwrap_or(0)).unwrap();
                let items = items.lock().unwrap();
                Ok(items.iter().skip(from).copied().collect::<Vec<_>>())
            }
        })
        .shared()
    }

    fn summing() -> (Subscriber<i64, i64, i64>, InMemoryProjectionStore<i64, i64>) {
        Subscriber::in_memory(aggregator::fold(|total: i64, n: &i64| total + n))
    }

    #[tokio::test]
    async fn catches_up_in_batches() {
        let catchup = StreamCatchup::new(numbers(Arc::new(Mutex::new((1..=25).collect()))))
            .with_batch_size(10);
        let (subscriber, store) = summing();
        let _ = catchup.subscribe(subscriber);

        let first = catchup.run_single_batch().await.unwrap();
        assert_eq!(first, BatchOutcome { fetched: 10, applied: 10, skipped: false });

        let total = catchup.run_until_caught_up().await.unwrap();
        assert_eq!(total, 15);

        let projection = store.find("numbers").await.unwrap();
        assert_eq!(projection.value, (1..=25).sum::<i64>());
        assert_eq!(projection.cursor.position(), Some(&25));
    }

    #[tokio::test]
    async fn new_data_is_applied_without_replay() {
        let items = Arc::new(Mutex::new(vec![1, 2, 3]));
        let catchup = StreamCatchup::new(numbers(Arc::clone(&items)));
        let (subscriber, store) = summing();
        let _ = catchup.subscribe(subscriber);

        catchup.run_until_caught_up().await.unwrap();
        assert_eq!(store.find("numbers").await.unwrap().value, 6);

        items.lock().unwrap().push(100);
        let applied = catchup.run_until_caught_up().await.unwrap();

        let projection = store.find("numbers").await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(projection.value, 106);
        assert_eq!(projection.cursor.position(), Some(&4));
    }

    #[tokio::test]
    async fn late_subscribers_do_not_double_apply() {
        let catchup = StreamCatchup::new(numbers(Arc::new(Mutex::new((1..=10).collect()))))
            .with_batch_size(4);
        let (early, early_store) = summing();
        let (late, late_store) = summing();
        late_store
            .put("numbers", Projection::with_cursor(1 + 2 + 3 + 4 + 5 + 6, Cursor::at(6)))
            .await
            .unwrap();

        let _ = catchup.subscribe(early);
        let _ = catchup.subscribe(late);
        catchup.run_until_caught_up().await.unwrap();

        assert_eq!(early_store.find("numbers").await.unwrap().value, 55);
        assert_eq!(late_store.find("numbers").await.unwrap().value, 55);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_hold_back_the_others() {
        let catchup = StreamCatchup::new(numbers(Arc::new(Mutex::new(vec![1, 2, 3]))));
        let (healthy, healthy_store) = summing();
        let broken_store = InMemoryProjectionStore::<i64, i64>::new();
        let broken = Subscriber::<i64, i64, i64>::new(
            aggregator::try_fold(|_: i64, _: &i64| Err(anyhow::anyhow!("bad data"))),
            Arc::new(broken_store.clone()),
        );

        let _ = catchup.subscribe(broken);
        let _ = catchup.subscribe(healthy);

        let error = catchup.run_single_batch().await.unwrap_err();
        assert!(matches!(error, CatchupError::Aggregation { .. }));
        assert_eq!(healthy_store.find("numbers").await.unwrap().value, 6);
        assert!(broken_store.find("numbers").await.is_none());
    }

    fn always_failing(store: &InMemoryProjectionStore<i64, i64>) -> Subscriber<i64, i64, i64> {
        Subscriber::<i64, i64, i64>::new(
            aggregator::try_fold(|_: i64, _: &i64| Err(anyhow::anyhow!("bad data"))),
            Arc::new(store.clone()),
        )
    }

    #[tokio::test]
    async fn skipped_failures_do_not_stall_healthy_subscribers_across_batches() {
        let catchup = StreamCatchup::new(numbers(Arc::new(Mutex::new((1..=25).collect()))))
            .with_batch_size(10);
        let broken_store = InMemoryProjectionStore::<i64, i64>::new();
        let (healthy, healthy_store) = summing();
        let _ = catchup.subscribe(always_failing(&broken_store).on_error(|failure| failure.continue_catchup()));
        let _ = catchup.subscribe(healthy);

        let applied = catchup.run_until_caught_up().await.unwrap();

        assert_eq!(applied, 25);
        let projection = healthy_store.find("numbers").await.unwrap();
        assert_eq!(projection.value, (1..=25).sum::<i64>());
        assert_eq!(projection.cursor.position(), Some(&25));
        assert!(broken_store.find("numbers").await.is_none());

        // caught up: the broken subscriber re-reads its window but applies nothing
        assert_eq!(catchup.run_until_caught_up().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unhandled_failures_do_not_stall_healthy_subscribers_across_batches() {
        let catchup = StreamCatchup::new(numbers(Arc::new(Mutex::new((1..=25).collect()))))
            .with_batch_size(10);
        let broken_store = InMemoryProjectionStore::<i64, i64>::new();
        let (healthy, healthy_store) = summing();
        let _ = catchup.subscribe(always_failing(&broken_store));
        let _ = catchup.subscribe(healthy);

        for _ in 0..3 {
            let error = catchup.run_single_batch().await.unwrap_err();
            assert!(matches!(error, CatchupError::Aggregation { .. }));
        }

        let projection = healthy_store.find("numbers").await.unwrap();
        assert_eq!(projection.value, (1..=25).sum::<i64>());
        assert_eq!(projection.cursor.position(), Some(&25));
        assert!(broken_store.find("numbers").await.is_none());
    }

    #[tokio::test]
    async fn subscribers_at_the_same_cursor_share_a_fetch() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        let stream = FnStream::create("counted", move |query: Query<i64>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let from = query.cursor().position().copied().unwrap_or(0);
            async move { Ok(((from + 1)..=3).collect::<Vec<i64>>()) }
        });
        let catchup = StreamCatchup::new(stream.shared());
        let (one, one_store) = summing();
        let (two, two_store) = summing();
        let _ = catchup.subscribe(one);
        let _ = catchup.subscribe(two);

        let outcome = catchup.run_single_batch().await.unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.fetched, 3);
        assert_eq!(outcome.applied, 6);
        assert_eq!(one_store.find("counted").await.unwrap().value, 6);
        assert_eq!(two_store.find("counted").await.unwrap().value, 6);
    }

    #[tokio::test]
    async fn no_subscribers_means_no_fetch() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        let stream = FnStream::create("watched", move |_query: Query<i64>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(vec![1_i64]) }
        });
        let catchup = StreamCatchup::new(stream.shared());

        let outcome = catchup.run_single_batch().await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribed_projections_stop_receiving_batches() {
        let items = Arc::new(Mutex::new(vec![1, 2]));
        let catchup = StreamCatchup::new(numbers(Arc::clone(&items)));
        let (subscriber, store) = summing();
        let handle = catchup.subscribe(subscriber);

        catchup.run_until_caught_up().await.unwrap();
        assert!(handle.unsubscribe());

        items.lock().unwrap().push(10);
        catchup.run_until_caught_up().await.unwrap();
        assert_eq!(store.find("numbers").await.unwrap().value, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_runs_are_single_flight() {
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);
        let catchup = Arc::new(StreamCatchup::new(numbers(Arc::new(Mutex::new(vec![1, 2, 3])))));
        let (subscriber, store) = Subscriber::<i64, i64, i64>::in_memory(
            aggregator::fold(|total: i64, n: &i64| total + n).pipeline(
                move |value: i64, batch: Arc<Batch<i64, i64>>, next: Next<i64, i64, i64>| {
                    let mut gate = gate_rx.clone();
                    async move {
                        gate.wait_for(|open| *open).await?;
                        next.aggregate(value, batch).await
                    }
                },
            ),
        );
        let _ = catchup.subscribe(subscriber);

        let first = tokio::spawn({
            let catchup = Arc::clone(&catchup);
            async move { catchup.run_single_batch().await }
        });
        while !catchup.running.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        let second = catchup.run_single_batch().await.unwrap();
        assert!(second.skipped);

        gate_tx.send_replace(true);
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.applied, 3);
        assert_eq!(store.find("numbers").await.unwrap().value, 6);
    }
}
