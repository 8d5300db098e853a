//! Catchups spread over a distributor.
//!
//! Each partition of a [`PartitionedStream`] is a leasable resource. When a
//! distributor grants the lease on a partition, the catchup for that
//! partition runs exactly one batch and the lease is released. The catchup
//! for a partition is built on its first grant and reused afterwards, keyed
//! by the lease's resource name.
//!
//! Single-stream projections are keyed by the partition stream's id, so
//! another process resumes from whatever its projection stores hold. The
//! multi-stream variant also saves its upstream cursor per partition through
//! a [`CursorStore`](alluvial_core::CursorStore) keyed by resource name.

use crate::catchup::{Catchup, StreamCatchup};
use crate::distributor::{Distributor, DistributorError};
use crate::multi_stream::MultiStreamCatchup;
use crate::subscription::{Subscriber, SubscriptionHandle, SubscriptionRegistry};
use alluvial_core::cursor::CursorPosition;
use alluvial_core::lease::Lease;
use alluvial_core::partition::Partition;
use alluvial_core::projection::{InMemoryCursorStore, SharedCursorStore};
use alluvial_core::stream::{PartitionedStream, SharedStream, StreamOps};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Catchups by resource name, built on first use.
struct PartitionCatchups<C> {
    catchups: Mutex<HashMap<String, Arc<C>>>,
}

impl<C> PartitionCatchups<C> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            catchups: Mutex::new(HashMap::new()),
        })
    }

    fn get_or_build(&self, name: &str, build: impl FnOnce() -> C) -> Arc<C> {
        let mut catchups = self.catchups.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            catchups
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(build())),
        )
    }

    fn len(&self) -> usize {
        self.catchups.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

async fn run_one_batch<C: Catchup + ?Sized>(catchup: &C, resource: &str) -> anyhow::Result<()> {
    let outcome = catchup.run_single_batch().await?;
    tracing::debug!(
        resource = %resource,
        fetched = outcome.fetched,
        applied = outcome.applied,
        skipped = outcome.skipped,
        "Partition batch complete"
    );
    Ok(())
}

/// Catches projections up with a partitioned stream, one partition per
/// lease.
pub struct DistributedCatchup<D, P, Part> {
    stream: Arc<PartitionedStream<D, P, Part>>,
    subscriptions: Arc<SubscriptionRegistry<D, P>>,
    distributor: Distributor<Part>,
    batch_size: Option<usize>,
    catchups: Arc<PartitionCatchups<StreamCatchup<D, P>>>,
    registered: AtomicBool,
}

impl<D, P, Part> DistributedCatchup<D, P, Part>
where
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
    Part: Partition + Clone + 'static,
{
    /// A catchup over `stream` whose partitions are leased by `distributor`.
    ///
    /// The distributor must not have a receiver yet; this catchup registers
    /// its own the first time it is started or asked to distribute.
    #[must_use]
    pub fn new(stream: PartitionedStream<D, P, Part>, distributor: Distributor<Part>) -> Self {
        Self {
            stream: Arc::new(stream),
            subscriptions: SubscriptionRegistry::new(),
            distributor,
            batch_size: None,
            catchups: PartitionCatchups::new(),
            registered: AtomicBool::new(false),
        }
    }

    /// Limit how many items each partition batch fetches.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Feed `subscriber` from every partition.
    pub fn subscribe<V>(&self, subscriber: Subscriber<V, D, P>) -> SubscriptionHandle
    where
        V: Send + Sync + 'static,
    {
        self.subscriptions.subscribe(subscriber)
    }

    /// The distributor handing out partitions.
    #[must_use]
    pub const fn distributor(&self) -> &Distributor<Part> {
        &self.distributor
    }

    /// Number of partitions that have been granted at least once.
    #[must_use]
    pub fn partitions_seen(&self) -> usize {
        self.catchups.len()
    }

    /// Start the distributor's worker loops.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::ReceiverAlreadySet`] if the distributor
    /// was given another receiver, or whatever starting it reports.
    pub async fn start(&self) -> Result<(), DistributorError> {
        self.ensure_receiver()?;
        self.distributor.start().await
    }

    /// Stop the distributor, waiting for in-flight batches.
    pub async fn stop(&self) {
        self.distributor.stop().await;
    }

    /// Run `count` partition batches one after another, returning the
    /// partitions that were granted.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn distribute(&self, count: usize) -> Result<Vec<Part>, DistributorError> {
        self.ensure_receiver()?;
        self.distributor.distribute(count).await
    }

    fn ensure_receiver(&self) -> Result<(), DistributorError> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let stream = Arc::clone(&self.stream);
        let subscriptions = Arc::clone(&self.subscriptions);
        let catchups = Arc::clone(&self.catchups);
        let batch_size = self.batch_size;

        let registered = self.distributor.on_receive(move |lease: Lease<Part>| {
            let catchup = catchups.get_or_build(lease.name(), || {
                let catchup = StreamCatchup::with_registry(
                    stream.stream_for(lease.resource()).shared(),
                    Arc::clone(&subscriptions),
                );
                match batch_size {
                    Some(size) => catchup.with_batch_size(size),
                    None => catchup,
                }
            });
            async move { run_one_batch(&*catchup, lease.name()).await }
        });

        if registered.is_err() {
            self.registered.store(false, Ordering::Release);
        }
        registered
    }
}

/// Catches projections up with a partitioned stream of streams, one
/// partition per lease.
///
/// Each partition's upstream cursor is saved in the cursor store under the
/// partition's resource name. Substream cursors live with the projections,
/// keyed by substream id.
pub struct DistributedMultiStreamCatchup<D, P, UP, Part> {
    stream: Arc<PartitionedStream<SharedStream<D, P>, UP, Part>>,
    subscriptions: Arc<SubscriptionRegistry<D, P>>,
    distributor: Distributor<Part>,
    cursor_store: SharedCursorStore<UP>,
    batch_size: Option<usize>,
    substream_batch_size: Option<usize>,
    substream_concurrency: Option<usize>,
    catchups: Arc<PartitionCatchups<MultiStreamCatchup<D, P, UP>>>,
    registered: AtomicBool,
}

impl<D, P, UP, Part> DistributedMultiStreamCatchup<D, P, UP, Part>
where
    D: Clone + Send + Sync + 'static,
    P: CursorPosition,
    UP: CursorPosition,
    Part: Partition + Clone + 'static,
{
    /// A catchup over `stream` whose partitions are leased by `distributor`,
    /// keeping upstream cursors in memory.
    #[must_use]
    pub fn new(
        stream: PartitionedStream<SharedStream<D, P>, UP, Part>,
        distributor: Distributor<Part>,
    ) -> Self {
        Self {
            stream: Arc::new(stream),
            subscriptions: SubscriptionRegistry::new(),
            distributor,
            cursor_store: Arc::new(InMemoryCursorStore::new()),
            batch_size: None,
            substream_batch_size: None,
            substream_concurrency: None,
            catchups: PartitionCatchups::new(),
            registered: AtomicBool::new(false),
        }
    }

    /// Persist upstream cursors in `store`.
    #[must_use]
    pub fn with_cursor_store(mut self, store: SharedCursorStore<UP>) -> Self {
        self.cursor_store = store;
        self
    }

    /// Limit how many substreams each partition batch fetches.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Limit how many items each substream fetch returns.
    #[must_use]
    pub const fn with_substream_batch_size(mut self, batch_size: usize) -> Self {
        self.substream_batch_size = Some(batch_size);
        self
    }

    /// How many substreams of one partition are caught up at once.
    #[must_use]
    pub const fn with_substream_concurrency(mut self, concurrency: usize) -> Self {
        self.substream_concurrency = Some(concurrency);
        self
    }

    /// Feed `subscriber` from every substream of every partition.
    pub fn subscribe<V>(&self, subscriber: Subscriber<V, D, P>) -> SubscriptionHandle
    where
        V: Send + Sync + 'static,
    {
        self.subscriptions.subscribe(subscriber)
    }

    /// The distributor handing out partitions.
    #[must_use]
    pub const fn distributor(&self) -> &Distributor<Part> {
        &self.distributor
    }

    /// Start the distributor's worker loops.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::ReceiverAlreadySet`] if the distributor
    /// was given another receiver, or whatever starting it reports.
    pub async fn start(&self) -> Result<(), DistributorError> {
        self.ensure_receiver()?;
        self.distributor.start().await
    }

    /// Stop the distributor, waiting for in-flight batches.
    pub async fn stop(&self) {
        self.distributor.stop().await;
    }

    /// Run `count` partition batches one after another, returning the
    /// partitions that were granted.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn distribute(&self, count: usize) -> Result<Vec<Part>, DistributorError> {
        self.ensure_receiver()?;
        self.distributor.distribute(count).await
    }

    fn ensure_receiver(&self) -> Result<(), DistributorError> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let stream = Arc::clone(&self.stream);
        let subscriptions = Arc::clone(&self.subscriptions);
        let catchups = Arc::clone(&self.catchups);
        let cursor_store = Arc::clone(&self.cursor_store);
        let (batch_size, substream_batch_size, substream_concurrency) = (
            self.batch_size,
            self.substream_batch_size,
            self.substream_concurrency,
        );

        let registered = self.distributor.on_receive(move |lease: Lease<Part>| {
            let catchup = catchups.get_or_build(lease.name(), || {
                let mut catchup = MultiStreamCatchup::with_registry(
                    stream.stream_for(lease.resource()).shared(),
                    Arc::clone(&subscriptions),
                )
                .with_cursor_store(Arc::clone(&cursor_store))
                .with_cursor_key(lease.name());
                if let Some(size) = batch_size {
                    catchup = catchup.with_batch_size(size);
                }
                if let Some(size) = substream_batch_size {
                    catchup = catchup.with_substream_batch_size(size);
                }
                if let Some(concurrency) = substream_concurrency {
                    catchup = catchup.with_substream_concurrency(concurrency);
                }
                catchup
            });
            async move { run_one_batch(&*catchup, lease.name()).await }
        });

        if registered.is_err() {
            self.registered.store(false, Ordering::Release);
        }
        registered
    }
}
