//! Aggregators for asserting on what a catchup delivered.

use alluvial_core::aggregator::Aggregator;
use alluvial_core::cursor::CursorPosition;
use alluvial_core::stream::Batch;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Passes the projection through unchanged and remembers every item and
/// batch it saw.
///
/// Clones share the same record, so keep one to inspect after subscribing
/// another.
#[derive(Debug)]
pub struct RecordingAggregator<D> {
    items: Arc<Mutex<Vec<D>>>,
    batches: Arc<AtomicUsize>,
}

impl<D> Clone for RecordingAggregator<D> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            batches: Arc::clone(&self.batches),
        }
    }
}

impl<D> Default for RecordingAggregator<D> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
            batches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<D: Clone> RecordingAggregator<D> {
    /// A recorder that has seen nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every item seen, in the order it was aggregated.
    #[must_use]
    pub fn items(&self) -> Vec<D> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of non-empty batches seen.
    #[must_use]
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

impl<V, D, P> Aggregator<V, D, P> for RecordingAggregator<D>
where
    V: Send + 'static,
    D: Clone + Send + Sync,
    P: CursorPosition,
{
    fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<V>> {
        if !batch.is_empty() {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batch.iter().cloned());
        future::ready(Ok(projection)).boxed()
    }
}

/// Counts items into a `usize` projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountingAggregator;

impl<D, P> Aggregator<usize, D, P> for CountingAggregator
where
    D: Send + Sync,
    P: CursorPosition,
{
    fn aggregate(&self, projection: usize, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<usize>> {
        future::ready(Ok(projection + batch.len())).boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn batch(items: &[i64]) -> Arc<Batch<i64, i64>> {
        Arc::new(Batch::new(
            None,
            items.iter().map(|item| (*item, *item)).collect(),
        ))
    }

    #[tokio::test]
    async fn records_items_across_clones() {
        let recorder = RecordingAggregator::new();
        let subscribed = recorder.clone();

        let value = subscribed.aggregate("unchanged", batch(&[1, 2])).await.unwrap();
        subscribed.aggregate("unchanged", batch(&[])).await.unwrap();
        subscribed.aggregate("unchanged", batch(&[3])).await.unwrap();

        assert_eq!(value, "unchanged");
        assert_eq!(recorder.items(), vec![1, 2, 3]);
        assert_eq!(recorder.batches(), 2);
    }

    #[tokio::test]
    async fn counts_items() {
        let total = CountingAggregator.aggregate(2, batch(&[7, 8, 9])).await.unwrap();
        assert_eq!(total, 5);
    }
}
