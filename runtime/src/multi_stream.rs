//! Stream-of-streams catchup.
//!
//! The upstream yields substreams, typically one per aggregate touched since
//! the upstream cursor. Each batch of substreams is deduplicated by id and
//! the substreams are caught up concurrently, each keyed by its own id in the
//! projection stores. The upstream cursor is saved only once every substream
//! in the batch has been processed without an unhandled failure.

use crate::CatchupError;
use crate::catchup::{BatchOutcome, Catchup, RunGuard, catch_up_stream};
use crate::metrics::CatchupMetrics;
use crate::subscription::{SharedSubscription, Subscriber, SubscriptionHandle, SubscriptionRegistry};
use alluvial_core::cursor::CursorPosition;
use alluvial_core::projection::{InMemoryCursorStore, SharedCursorStore};
use alluvial_core::stream::{Query, SharedStream, Stream};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

const DEFAULT_SUBSTREAM_CONCURRENCY: usize = 8;

/// Catches projections up with every substream an upstream yields.
pub struct MultiStreamCatchup<D, P, UP> {
    upstream: SharedStream<SharedStream<D, P>, UP>,
    subscriptions: Arc<SubscriptionRegistry<D, P>>,
    cursor_store: SharedCursorStore<UP>,
    cursor_key: String,
    batch_size: Option<usize>,
    substream_batch_size: Option<usize>,
    concurrency: usize,
    running: AtomicBool,
}

impl<D, P, UP> MultiStreamCatchup<D, P, UP>
where
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
    UP: CursorPosition,
{
    /// A catchup over `upstream`, keeping its cursor in memory.
    #[must_use]
    pub fn new(upstream: SharedStream<SharedStream<D, P>, UP>) -> Self {
        Self::with_registry(upstream, SubscriptionRegistry::new())
    }

    pub(crate) fn with_registry(
        upstream: SharedStream<SharedStream<D, P>, UP>,
        subscriptions: Arc<SubscriptionRegistry<D, P>>,
    ) -> Self {
        let cursor_key = upstream.id().to_string();
        Self {
            upstream,
            subscriptions,
            cursor_store: Arc::new(InMemoryCursorStore::new()),
            cursor_key,
            batch_size: None,
            substream_batch_size: None,
            concurrency: DEFAULT_SUBSTREAM_CONCURRENCY,
            running: AtomicBool::new(false),
        }
    }

    /// Limit how many substreams each batch fetches from the upstream.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Limit how many items each substream fetch returns. Substreams are
    /// drained batch by batch within one run.
    #[must_use]
    pub const fn with_substream_batch_size(mut self, batch_size: usize) -> Self {
        self.substream_batch_size = Some(batch_size);
        self
    }

    /// How many substreams are caught up at once. Defaults to 8.
    #[must_use]
    pub fn with_substream_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Persist the upstream cursor in `store`.
    #[must_use]
    pub fn with_cursor_store(mut self, store: SharedCursorStore<UP>) -> Self {
        self.cursor_store = store;
        self
    }

    /// Name the upstream cursor is saved under. Defaults to the upstream id.
    #[must_use]
    pub fn with_cursor_key(mut self, key: impl Into<String>) -> Self {
        self.cursor_key = key.into();
        self
    }

    /// Feed `subscriber` from every substream.
    pub fn subscribe<V>(&self, subscriber: Subscriber<V, D, P>) -> SubscriptionHandle
    where
        V: Send + Sync + 'static,
    {
        self.subscriptions.subscribe(subscriber)
    }

    /// Id of the upstream.
    #[must_use]
    pub fn upstream_id(&self) -> &str {
        self.upstream.id()
    }

    async fn drain(
        &self,
        substream: &dyn Stream<Data = D, Position = P>,
        subscriptions: &[SharedSubscription<D, P>],
    ) -> Result<usize, CatchupError> {
        let mut applied = 0;
        loop {
            let outcome = catch_up_stream(substream, subscriptions, self.substream_batch_size).await?;
            applied += outcome.applied;

            if outcome.applied == 0 || !outcome.full {
                return Ok(applied);
            }
        }
    }

    #[tracing::instrument(skip(self), fields(upstream = %self.upstream.id()))]
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
        let cursor = match self.cursor_store.load(&self.cursor_key).await? {
            Some(cursor) => cursor,
            None => self.upstream.new_cursor(),
        };
        let mut query = Query::new(cursor);
        if let Some(size) = self.batch_size {
            query = query.with_batch_size(size);
        }

        let batch = self.upstream.fetch(&mut query).await?;
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut seen = HashSet::new();
        let substreams: Vec<&SharedStream<D, P>> = batch
            .iter()
            .filter(|substream| seen.insert(substream.id().to_string()))
            .collect();
        let distinct = substreams.len();

        let drains: Vec<_> = substreams
            .into_iter()
            .map(|substream| self.drain(&**substream, &subscriptions))
            .collect();
        let results: Vec<Result<usize, CatchupError>> = futures::stream::iter(drains)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut applied = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(items) => applied += items,
                Err(error) => {
                    tracing::warn!(error = %error, "Substream catchup failed");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        self.cursor_store.save(&self.cursor_key, query.cursor()).await?;
        CatchupMetrics::record_batch(applied, started.elapsed());

        tracing::debug!(
            fetched = batch.len(),
            substreams = distinct,
            applied,
            "Batch complete"
        );
        Ok(BatchOutcome {
            fetched: batch.len(),
            applied,
            skipped: false,
        })
    }
}

impl<D, P, UP> Catchup for MultiStreamCatchup<D, P, UP>
where
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
    UP: CursorPosition,
{
    fn run_single_batch(&self) -> BoxFuture<'_, Result<BatchOutcome, CatchupError>> {
        Box::pin(self.run_batch())
    }
}
