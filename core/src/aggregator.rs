//! Aggregators fold batches of stream data into projections.
//!
//! An [`Aggregator`] has one operation: take the current projection value
//! and a batch, return the updated value. Aggregators compose as middleware
//! through [`AggregatorExt::pipeline`]: the pipeline function receives the
//! projection, the batch and a [`Next`] handle for the wrapped aggregator, and
//! may inspect or replace the batch, short-circuit, retry, or swallow errors.
//! [`AggregatorExt::before`], [`AggregatorExt::after`] and
//! [`AggregatorExt::traced`] are pipelines too.
//!
//! # Example
//!
//! ```
//! use alluvial_core::aggregator::{self, Aggregator, AggregatorExt};
//! use alluvial_core::stream::Batch;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let sum = aggregator::fold(|total: i64, n: &i64| total + n)
//!     .after(|total, _batch: &Batch<i64, i64>| total * 2);
//!
//! let batch = Arc::new(Batch::new(None, vec![(1_i64, 1_i64), (2, 2), (3, 3)]));
//! assert_eq!(sum.aggregate(0, batch).await.unwrap(), 12);
//! # });
//! ```

use crate::cursor::CursorPosition;
use crate::stream::Batch;
use futures::future::{self, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

/// Folds a batch into a projection value.
pub trait Aggregator<V, D, P>: Send + Sync {
    /// Apply `batch` to `projection`, returning the updated value.
    ///
    /// # Errors
    ///
    /// Whatever the aggregation logic reports; the caller decides whether the
    /// failure stops the catchup.
    fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<V>>;
}

/// A type-erased, shareable aggregator.
pub type SharedAggregator<V, D, P> = Arc<dyn Aggregator<V, D, P>>;

impl<V, D, P> Aggregator<V, D, P> for Arc<dyn Aggregator<V, D, P>> {
    fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<V>> {
        (**self).aggregate(projection, batch)
    }
}

/// Aggregator backed by an async function. See [`from_fn`].
pub struct FnAggregator<F>(F);

impl<V, D, P, F, Fut> Aggregator<V, D, P> for FnAggregator<F>
where
    F: Fn(V, Arc<Batch<D, P>>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<V>> {
        (self.0)(projection, batch).boxed()
    }
}

/// Build an aggregator from an async function over the whole batch.
pub const fn from_fn<F>(f: F) -> FnAggregator<F> {
    FnAggregator(f)
}

/// Aggregator folding items one at a time. See [`fold`].
pub struct Fold<F>(F);

impl<V, D, P, F> Aggregator<V, D, P> for Fold<F>
where
    V: Send + 'static,
    P: CursorPosition,
    F: Fn(V, &D) -> V + Send + Sync,
{
    fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<V>> {
        let folded = batch.iter().fold(projection, |value, item| (self.0)(value, item));
        future::ready(Ok(folded)).boxed()
    }
}

/// Build an aggregator from an infallible per-item fold.
pub const fn fold<F>(f: F) -> Fold<F> {
    Fold(f)
}

/// Aggregator folding items one at a time, stopping at the first error. See
/// [`try_fold`].
pub struct TryFold<F>(F);

impl<V, D, P, F> Aggregator<V, D, P> for TryFold<F>
where
    V: Send + 'static,
    P: CursorPosition,
    F: Fn(V, &D) -> anyhow::Result<V> + Send + Sync,
{
    fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<V>> {
        let folded = batch
            .iter()
            .try_fold(projection, |value, item| (self.0)(value, item));
        future::ready(folded).boxed()
    }
}

/// Build an aggregator from a fallible per-item fold.
pub const fn try_fold<F>(f: F) -> TryFold<F> {
    TryFold(f)
}

/// Handle to the rest of a pipeline.
pub struct Next<V, D, P> {
    inner: SharedAggregator<V, D, P>,
}

impl<V, D, P> Clone for Next<V, D, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, D, P> Next<V, D, P>
where
    V: Send + 'static,
    D: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    /// Run the wrapped aggregator.
    ///
    /// May be called more than once (to retry) or not at all (to
    /// short-circuit).
    ///
    /// # Errors
    ///
    /// Whatever the wrapped aggregator reports.
    pub fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'static, anyhow::Result<V>> {
        let inner = Arc::clone(&self.inner);
        async move { inner.aggregate(projection, batch).await }.boxed()
    }
}

/// An aggregator wrapped in middleware. See [`AggregatorExt::pipeline`].
pub struct Pipeline<V, D, P, F> {
    inner: SharedAggregator<V, D, P>,
    middleware: F,
}

impl<V, D, P, F, Fut> Aggregator<V, D, P> for Pipeline<V, D, P, F>
where
    V: Send + 'static,
    D: Send + Sync + 'static,
    P: Send + Sync + 'static,
    F: Fn(V, Arc<Batch<D, P>>, Next<V, D, P>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    fn aggregate(&self, projection: V, batch: Arc<Batch<D, P>>) -> BoxFuture<'_, anyhow::Result<V>> {
        let next = Next {
            inner: Arc::clone(&self.inner),
        };
        (self.middleware)(projection, batch, next).boxed()
    }
}

/// Combinators available on every aggregator.
pub trait AggregatorExt<V, D, P>: Aggregator<V, D, P> + Sized + 'static
where
    V: Send + 'static,
    D: Send + Sync + 'static,
    P: CursorPosition,
{
    /// Wrap this aggregator in middleware.
    fn pipeline<F, Fut>(self, middleware: F) -> Pipeline<V, D, P, F>
    where
        F: Fn(V, Arc<Batch<D, P>>, Next<V, D, P>) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Pipeline {
            inner: Arc::new(self),
            middleware,
        }
    }

    /// Transform the projection before aggregation.
    fn before<F>(self, hook: F) -> impl Aggregator<V, D, P>
    where
        F: Fn(V, &Batch<D, P>) -> V + Send + Sync + 'static,
    {
        self.pipeline(move |projection, batch, next| {
            let projection = hook(projection, &batch);
            next.aggregate(projection, batch)
        })
    }

    /// Transform the projection after successful aggregation.
    fn after<F>(self, hook: F) -> impl Aggregator<V, D, P>
    where
        F: Fn(V, &Batch<D, P>) -> V + Send + Sync + 'static,
    {
        let hook = Arc::new(hook);
        self.pipeline(move |projection, batch, next| {
            let hook = Arc::clone(&hook);
            async move {
                let projection = next.aggregate(projection, Arc::clone(&batch)).await?;
                Ok(hook(projection, &batch))
            }
        })
    }

    /// Log each aggregation under `name`.
    fn traced(self, name: impl Into<String>) -> impl Aggregator<V, D, P> {
        let name: Arc<str> = Arc::from(name.into());
        self.pipeline(move |projection, batch, next| {
            let name = Arc::clone(&name);
            async move {
                let items = batch.len();
                tracing::debug!(aggregator = %name, items, "Aggregating batch");
                match next.aggregate(projection, batch).await {
                    Ok(projection) => {
                        tracing::debug!(aggregator = %name, items, "Aggregated batch");
                        Ok(projection)
                    }
                    Err(e) => {
                        tracing::warn!(aggregator = %name, items, error = %e, "Aggregation failed");
                        Err(e)
                    }
                }
            }
        })
    }

    /// Erase the concrete aggregator type.
    fn shared(self) -> SharedAggregator<V, D, P> {
        Arc::new(self)
    }
}

impl<V, D, P, A> AggregatorExt<V, D, P> for A
where
    A: Aggregator<V, D, P> + 'static,
    V: Send + 'static,
    D: Send + Sync + 'static,
    P: CursorPosition,
{
}
