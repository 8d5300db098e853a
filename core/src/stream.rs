//! Pull-based streams: fetch the next chunk of data after a cursor.
//!
//! A [`Stream`] answers one question: "what comes after this cursor?". Each
//! call to [`Stream::fetch`] returns a [`Batch`] and advances the query's
//! cursor to the position after the last item returned. Fetching again from
//! the same position must return the same data, so callers can retry freely.
//!
//! Streams can be built from plain async functions with [`FnStream`], mapped
//! and requeried into streams of streams with [`StreamOps`], and split per
//! partition with [`PartitionedStream`].
//!
//! # Example
//!
//! ```
//! use alluvial_core::stream::{FnStream, Query, Stream};
//!
//! # tokio_test::block_on(async {
//! let numbers = FnStream::create("numbers", |query: Query<i64>| async move {
//!     let from = query.cursor().position().copied().unwrap_or(0);
//!     let take = query.batch_size().unwrap_or(10) as i64;
//!     Ok((from..(from + take).min(25)).collect::<Vec<i64>>())
//! });
//!
//! let mut query = Query::new(numbers.new_cursor()).with_batch_size(10);
//! let batch = numbers.fetch(&mut query).await.unwrap();
//!
//! assert_eq!(batch.len(), 10);
//! assert_eq!(query.cursor().position(), Some(&10));
//! # });
//! ```

use crate::cursor::{Cursor, CursorError, CursorPosition, Incrementable};
use crate::partition::Partition;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while fetching from a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The data source failed.
    #[error("Failed to fetch from stream {stream_id}: {message}")]
    Fetch {
        /// Id of the stream being fetched.
        stream_id: String,
        /// Rendered source error.
        message: String,
    },

    /// The query cursor could not be advanced.
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

impl StreamError {
    fn fetch(stream_id: &str, error: &anyhow::Error) -> Self {
        Self::Fetch {
            stream_id: stream_id.to_string(),
            message: format!("{error:#}"),
        }
    }
}

/// A query against a stream: where to start and how much to take.
#[derive(Clone, Debug)]
pub struct Query<P> {
    cursor: Cursor<P>,
    batch_size: Option<usize>,
}

impl<P: CursorPosition> Query<P> {
    /// Query from `cursor` with no batch size hint.
    #[must_use]
    pub const fn new(cursor: Cursor<P>) -> Self {
        Self {
            cursor,
            batch_size: None,
        }
    }

    /// Limit the number of items fetched.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// The cursor the query starts from.
    #[must_use]
    pub const fn cursor(&self) -> &Cursor<P> {
        &self.cursor
    }

    /// Mutable access to the query cursor.
    pub const fn cursor_mut(&mut self) -> &mut Cursor<P> {
        &mut self.cursor
    }

    /// Batch size hint, if any.
    #[must_use]
    pub const fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    /// Consume the query, returning its cursor.
    #[must_use]
    pub fn into_cursor(self) -> Cursor<P> {
        self.cursor
    }

    /// A copy of this query whose cursor cannot be advanced.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            cursor: self.cursor.read_only(),
            batch_size: self.batch_size,
        }
    }
}

/// An immutable slice of stream data.
///
/// Every item is paired with the position a cursor reaches once that item has
/// been consumed, which is what lets subscribers prune items they have
/// already applied.
#[derive(Clone, Debug)]
pub struct Batch<D, P> {
    start: Option<P>,
    entries: Vec<(P, D)>,
}

impl<D, P: CursorPosition> Batch<D, P> {
    /// Build a batch from `(position, item)` pairs in stream order.
    #[must_use]
    pub const fn new(start: Option<P>, entries: Vec<(P, D)>) -> Self {
        Self { start, entries }
    }

    /// An empty batch starting at `start`.
    #[must_use]
    pub const fn empty(start: Option<P>) -> Self {
        Self {
            start,
            entries: Vec::new(),
        }
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Items in stream order.
    pub fn iter(&self) -> impl Iterator<Item = &D> {
        self.entries.iter().map(|(_, item)| item)
    }

    /// `(position, item)` pairs in stream order.
    #[must_use]
    pub fn entries(&self) -> &[(P, D)] {
        &self.entries
    }

    /// Cursor position the batch was fetched from.
    #[must_use]
    pub const fn start_position(&self) -> Option<&P> {
        self.start.as_ref()
    }

    /// Position reached after the last item, if there are any items.
    #[must_use]
    pub fn end_position(&self) -> Option<&P> {
        self.entries.last().map(|(position, _)| position)
    }

    /// Consume the batch, returning its items.
    #[must_use]
    pub fn into_items(self) -> Vec<D> {
        self.entries.into_iter().map(|(_, item)| item).collect()
    }

    /// Transform each item, keeping positions.
    #[must_use]
    pub fn map<D2>(self, mut f: impl FnMut(D) -> D2) -> Batch<D2, P> {
        Batch {
            start: self.start,
            entries: self
                .entries
                .into_iter()
                .map(|(position, item)| (position, f(item)))
                .collect(),
        }
    }

    /// Drop every item `cursor` has already reached.
    ///
    /// Returns the same allocation when nothing needs pruning.
    #[must_use]
    pub fn prune(batch: &Arc<Self>, cursor: &Cursor<P>) -> Arc<Self>
    where
        D: Clone,
    {
        if !batch
            .entries
            .iter()
            .any(|(position, _)| cursor.has_reached(position))
        {
            return Arc::clone(batch);
        }

        Arc::new(Self {
            start: cursor.position().cloned().or_else(|| batch.start.clone()),
            entries: batch
                .entries
                .iter()
                .filter(|(position, _)| !cursor.has_reached(position))
                .cloned()
                .collect(),
        })
    }
}

/// A source of ordered data that can be fetched incrementally.
///
/// Implementations must be re-fetchable: fetching twice from the same cursor
/// position returns the same items.
pub trait Stream: Send + Sync {
    /// The items produced.
    type Data: Send + Sync + 'static;

    /// The cursor position type.
    type Position: CursorPosition;

    /// Stable identifier, used to key projections and persisted cursors.
    fn id(&self) -> &str;

    /// A cursor at the start of this stream.
    fn new_cursor(&self) -> Cursor<Self::Position> {
        Cursor::new()
    }

    /// Fetch the next batch after `query`'s cursor and advance that cursor to
    /// the position after the last item returned.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError`] if the source fails or the cursor cannot move.
    fn fetch<'a>(
        &'a self,
        query: &'a mut Query<Self::Position>,
    ) -> BoxFuture<'a, Result<Batch<Self::Data, Self::Position>, StreamError>>;
}

/// A type-erased, shareable stream.
pub type SharedStream<D, P> = Arc<dyn Stream<Data = D, Position = P>>;

impl<D, P> fmt::Debug for dyn Stream<Data = D, Position = P>
where
    D: Send + Sync + 'static,
    P: CursorPosition,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.id()).finish()
    }
}

type FetchFn<D, P> = Arc<dyn Fn(Query<P>) -> BoxFuture<'static, anyhow::Result<Vec<D>>> + Send + Sync>;
type CursorFactory<P> = Arc<dyn Fn() -> Cursor<P> + Send + Sync>;

/// How a function-backed stream works out item positions.
enum Positioning<D, P> {
    /// Item `n` (1-based) leaves the cursor `n` steps further along.
    Counted(fn(&Cursor<P>, usize) -> P),
    /// Items carry their own position.
    ByItem(Arc<dyn Fn(&D) -> P + Send + Sync>),
}

impl<D, P> Clone for Positioning<D, P> {
    fn clone(&self) -> Self {
        match self {
            Self::Counted(after) => Self::Counted(*after),
            Self::ByItem(position_of) => Self::ByItem(Arc::clone(position_of)),
        }
    }
}

impl<D, P: CursorPosition> Positioning<D, P> {
    fn position(&self, cursor: &Cursor<P>, index: usize, item: &D) -> P {
        match self {
            Self::Counted(after) => after(cursor, index + 1),
            Self::ByItem(position_of) => position_of(item),
        }
    }
}

fn boxed_fetch<D, P, F, Fut>(fetch: F) -> FetchFn<D, P>
where
    F: Fn(Query<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<D>>> + Send + 'static,
{
    Arc::new(move |query| fetch(query).boxed())
}

fn default_cursor<P: CursorPosition>() -> CursorFactory<P> {
    Arc::new(Cursor::new)
}

/// A stream backed by an async fetch function.
///
/// The fetch function receives a read-only snapshot of the query; the stream
/// itself advances the authoritative cursor once items come back. Fetch
/// functions may return more items than the batch size hint, in which case
/// the excess is dropped and fetched again next time.
pub struct FnStream<D, P> {
    id: String,
    fetch: FetchFn<D, P>,
    positioning: Positioning<D, P>,
    new_cursor: CursorFactory<P>,
}

impl<D, P> FnStream<D, P>
where
    D: Send + Sync + 'static,
    P: CursorPosition,
{
    /// A stream whose positions are counted: each item moves the cursor one
    /// step.
    pub fn create<F, Fut>(id: impl Into<String>, fetch: F) -> Self
    where
        P: Incrementable,
        F: Fn(Query<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<D>>> + Send + 'static,
    {
        Self {
            id: id.into(),
            fetch: boxed_fetch(fetch),
            positioning: Positioning::Counted(Cursor::position_after),
            new_cursor: default_cursor(),
        }
    }

    /// A stream whose items carry their own position.
    pub fn create_positioned<F, Fut, G>(id: impl Into<String>, fetch: F, position_of: G) -> Self
    where
        F: Fn(Query<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<D>>> + Send + 'static,
        G: Fn(&D) -> P + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            fetch: boxed_fetch(fetch),
            positioning: Positioning::ByItem(Arc::new(position_of)),
            new_cursor: default_cursor(),
        }
    }

    /// Replace the cursor factory (for descending streams or non-zero
    /// origins).
    #[must_use]
    pub fn with_new_cursor(mut self, new_cursor: impl Fn() -> Cursor<P> + Send + Sync + 'static) -> Self {
        self.new_cursor = Arc::new(new_cursor);
        self
    }
}

impl<D, P> Stream for FnStream<D, P>
where
    D: Send + Sync + 'static,
    P: CursorPosition,
{
    type Data = D;
    type Position = P;

    fn id(&self) -> &str {
        &self.id
    }

    fn new_cursor(&self) -> Cursor<P> {
        (self.new_cursor)()
    }

    fn fetch<'a>(&'a self, query: &'a mut Query<P>) -> BoxFuture<'a, Result<Batch<D, P>, StreamError>> {
        Box::pin(async move {
            let start = query.cursor().position().cloned();
            let items = (self.fetch)(query.snapshot())
                .await
                .map_err(|e| StreamError::fetch(&self.id, &e))?;

            let limit = query.batch_size().unwrap_or(usize::MAX);
            let entries: Vec<(P, D)> = items
                .into_iter()
                .take(limit)
                .enumerate()
                .map(|(index, item)| {
                    (self.positioning.position(query.cursor(), index, &item), item)
                })
                .collect();

            if let Some((last, _)) = entries.last() {
                query.cursor_mut().advance_to(last.clone())?;
            }

            tracing::trace!(stream_id = %self.id, items = entries.len(), "Fetched batch");
            Ok(Batch::new(start, entries))
        })
    }
}

/// A stream that transforms another stream's items.
///
/// Positions and cursor advancement belong to the source stream.
pub struct Mapped<S, F> {
    source: S,
    map: F,
}

impl<S, F, D2> Stream for Mapped<S, F>
where
    S: Stream,
    F: Fn(S::Data) -> D2 + Send + Sync,
    D2: Send + Sync + 'static,
{
    type Data = D2;
    type Position = S::Position;

    fn id(&self) -> &str {
        self.source.id()
    }

    fn new_cursor(&self) -> Cursor<S::Position> {
        self.source.new_cursor()
    }

    fn fetch<'a>(
        &'a self,
        query: &'a mut Query<S::Position>,
    ) -> BoxFuture<'a, Result<Batch<D2, S::Position>, StreamError>> {
        Box::pin(async move {
            let batch = self.source.fetch(query).await?;
            Ok(batch.map(&self.map))
        })
    }
}

/// Combinators available on every stream.
pub trait StreamOps: Stream + Sized {
    /// Transform each item without re-querying.
    fn map<D2, F>(self, map: F) -> Mapped<Self, F>
    where
        F: Fn(Self::Data) -> D2 + Send + Sync,
        D2: Send + Sync + 'static,
    {
        Mapped { source: self, map }
    }

    /// Turn each item into a stream of its own, producing a stream of streams.
    fn requery<D2, P2, F>(self, open: F) -> Mapped<Self, F>
    where
        F: Fn(Self::Data) -> SharedStream<D2, P2> + Send + Sync,
        D2: Send + Sync + 'static,
        P2: CursorPosition,
    {
        Mapped {
            source: self,
            map: open,
        }
    }

    /// Erase the concrete stream type.
    fn shared(self) -> SharedStream<Self::Data, Self::Position>
    where
        Self: 'static,
    {
        Arc::new(self)
    }
}

impl<S: Stream + Sized> StreamOps for S {}

type PartitionFetchFn<D, P, Part> =
    Arc<dyn Fn(Query<P>, Part) -> BoxFuture<'static, anyhow::Result<Vec<D>>> + Send + Sync>;

/// A family of independent streams, one per partition.
///
/// Each partition's stream forwards the partition to the fetch function and
/// gets its own id so that cursors are tracked per partition.
pub struct PartitionedStream<D, P, Part> {
    id: String,
    fetch: PartitionFetchFn<D, P, Part>,
    positioning: Positioning<D, P>,
    new_cursor: CursorFactory<P>,
}

impl<D, P, Part> PartitionedStream<D, P, Part>
where
    D: Send + Sync + 'static,
    P: CursorPosition,
    Part: Partition + Clone + 'static,
{
    /// A partitioned stream with counted positions.
    pub fn create<F, Fut>(id: impl Into<String>, fetch: F) -> Self
    where
        P: Incrementable,
        F: Fn(Query<P>, Part) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<D>>> + Send + 'static,
    {
        Self {
            id: id.into(),
            fetch: Arc::new(move |query, partition| fetch(query, partition).boxed()),
            positioning: Positioning::Counted(Cursor::position_after),
            new_cursor: default_cursor(),
        }
    }

    /// A partitioned stream whose items carry their own position.
    pub fn create_positioned<F, Fut, G>(id: impl Into<String>, fetch: F, position_of: G) -> Self
    where
        F: Fn(Query<P>, Part) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<D>>> + Send + 'static,
        G: Fn(&D) -> P + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            fetch: Arc::new(move |query, partition| fetch(query, partition).boxed()),
            positioning: Positioning::ByItem(Arc::new(position_of)),
            new_cursor: default_cursor(),
        }
    }

    /// Replace the cursor factory used by every partition's stream.
    #[must_use]
    pub fn with_new_cursor(mut self, new_cursor: impl Fn() -> Cursor<P> + Send + Sync + 'static) -> Self {
        self.new_cursor = Arc::new(new_cursor);
        self
    }

    /// Id shared by all partitions.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stream for one partition.
    #[must_use]
    pub fn stream_for(&self, partition: &Part) -> FnStream<D, P> {
        let fetch = Arc::clone(&self.fetch);
        let bound = partition.clone();
        FnStream {
            id: format!("{}:{}", self.id, partition.name()),
            fetch: Arc::new(move |query| fetch(query, bound.clone())),
            positioning: self.positioning.clone(),
            new_cursor: Arc::clone(&self.new_cursor),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::partition::{self, RangePartition};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(limit: i64) -> FnStream<i64, i64> {
        FnStream::create("counting", move |query: Query<i64>| async move {
            let from = query.cursor().position().copied().unwrap_or(0);
            let size = i64::try_from(query.batch_size().unwrap_or(100)).unwrap();
            Ok(((from + 1)..=(from + size).min(limit)).collect())
        })
    }

    #[tokio::test]
    async fn counted_stream_advances_by_item_count() {
        let stream = counting(25);
        let mut query = Query::new(stream.new_cursor()).with_batch_size(10);

        let first = stream.fetch(&mut query).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first.start_position(), None);
        assert_eq!(first.end_position(), Some(&10));
        assert_eq!(query.cursor().position(), Some(&10));

        let second = stream.fetch(&mut query).await.unwrap();
        assert_eq!(second.iter().copied().collect::<Vec<_>>(), (11..=20).collect::<Vec<_>>());

        stream.fetch(&mut query).await.unwrap();
        let drained = stream.fetch(&mut query).await.unwrap();
        assert!(drained.is_empty());
        assert_eq!(query.cursor().position(), Some(&25));
    }

    #[tokio::test]
    async fn fetch_function_sees_a_read_only_cursor() {
        let stream = FnStream::create("guarded", |mut query: Query<i64>| async move {
            assert!(query.cursor().is_read_only());
            assert!(query.cursor_mut().advance_to(99).is_err());
            Ok(vec!["a"])
        });
        let mut query = Query::new(stream.new_cursor());

        stream.fetch(&mut query).await.unwrap();
        assert_eq!(query.cursor().position(), Some(&1));
    }

    #[tokio::test]
    async fn oversized_results_are_truncated_to_the_batch_size() {
        let stream = FnStream::create("greedy", |_query: Query<u64>| async move {
            Ok((0..50).collect::<Vec<u32>>())
        });
        let mut query = Query::new(stream.new_cursor()).with_batch_size(5);

        let batch = stream.fetch(&mut query).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(query.cursor().position(), Some(&5));
    }

    #[tokio::test]
    async fn positioned_stream_uses_item_positions() {
        let stream = FnStream::create_positioned(
            "letters",
            |query: Query<String>| async move {
                let after = query.cursor().position().cloned().unwrap_or_default();
                Ok(["apple", "banana", "cherry"]
                    .into_iter()
                    .map(str::to_string)
                    .filter(|word| *word > after)
                    .collect::<Vec<_>>())
            },
            String::clone,
        );
        let mut query = Query::new(stream.new_cursor());
        query.cursor_mut().advance_to("apple".to_string()).unwrap();

        let batch = stream.fetch(&mut query).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(query.cursor().position(), Some(&"cherry".to_string()));
    }

    #[tokio::test]
    async fn failing_source_reports_stream_id() {
        let stream = FnStream::create("broken", |_query: Query<i64>| async move {
            Err::<Vec<i64>, _>(anyhow::anyhow!("connection refused"))
        });
        let mut query = Query::new(stream.new_cursor());

        let error = stream.fetch(&mut query).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Failed to fetch from stream broken: connection refused"
        );
        assert_eq!(query.cursor().position(), None);
    }

    #[tokio::test]
    async fn descending_counted_stream_moves_down() {
        let stream = FnStream::create("countdown", |_query: Query<i64>| async move {
            Ok(vec!["x", "y"])
        })
        .with_new_cursor(|| Cursor::at(100).descending());
        let mut query = Query::new(stream.new_cursor());

        let batch = stream.fetch(&mut query).await.unwrap();
        assert_eq!(batch.entries()[0].0, 99);
        assert_eq!(query.cursor().position(), Some(&98));
    }

    #[test]
    fn prune_drops_reached_items_and_reuses_untouched_batches() {
        let batch = Arc::new(Batch::new(
            Some(0),
            vec![(1, "a"), (2, "b"), (3, "c"), (4, "d")],
        ));

        let pruned = Batch::prune(&batch, &Cursor::at(2));
        assert_eq!(pruned.iter().copied().collect::<Vec<_>>(), vec!["c", "d"]);
        assert_eq!(pruned.start_position(), Some(&2));

        let untouched = Batch::prune(&batch, &Cursor::new());
        assert!(Arc::ptr_eq(&batch, &untouched));

        let descending = Arc::new(Batch::new(Some(10), vec![(9, "a"), (8, "b"), (7, "c")]));
        let pruned = Batch::prune(&descending, &Cursor::at(8).descending());
        assert_eq!(pruned.iter().copied().collect::<Vec<_>>(), vec!["c"]);
    }

    #[tokio::test]
    async fn map_preserves_positions_and_cursor_ownership() {
        let stream = counting(3).map(|n| n * 10);
        let mut query = Query::new(stream.new_cursor());

        let batch = stream.fetch(&mut query).await.unwrap();
        assert_eq!(stream.id(), "counting");
        assert_eq!(
            batch.entries().to_vec(),
            vec![(1, 10), (2, 20), (3, 30)]
        );
        assert_eq!(query.cursor().position(), Some(&3));
    }

    #[tokio::test]
    async fn requery_produces_a_stream_of_streams() {
        let index = counting(3).requery(|key: i64| {
            FnStream::create(format!("key-{key}"), move |query: Query<i64>| async move {
                let seen = query.cursor().position().copied().unwrap_or(0);
                Ok(if seen == 0 { vec![key] } else { vec![] })
            })
            .shared()
        });
        let mut query = Query::new(index.new_cursor());

        let streams = index.fetch(&mut query).await.unwrap();
        let ids: Vec<&str> = streams.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["key-1", "key-2", "key-3"]);

        let second = &streams.entries()[1].1;
        let mut inner = Query::new(second.new_cursor());
        let batch = second.fetch(&mut inner).await.unwrap();
        assert_eq!(batch.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn partitioned_streams_are_independent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let partitioned = PartitionedStream::create(
            "numbers",
            move |query: Query<i64>, partition: RangePartition<i32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let from = query.cursor().position().copied().unwrap_or(0);
                    Ok(((*partition.lower_bound_exclusive() + 1)..=*partition.upper_bound_inclusive())
                        .skip(usize::try_from(from).unwrap())
                        .take(2)
                        .collect::<Vec<i32>>())
                }
            },
        );

        let parts = partition::by_range(0, 10).unwrap().among(2).unwrap();
        let low = partitioned.stream_for(&parts[0]);
        let high = partitioned.stream_for(&parts[1]);
        assert_eq!(low.id(), "numbers:(0..5]");
        assert_eq!(high.id(), "numbers:(5..10]");

        let mut low_query = Query::new(low.new_cursor());
        let mut high_query = Query::new(high.new_cursor());
        let a = low.fetch(&mut low_query).await.unwrap();
        let b = high.fetch(&mut high_query).await.unwrap();

        assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![6, 7]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
