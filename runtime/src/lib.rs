//! # Alluvial Runtime
//!
//! Engines that drive the core types: catchups that replay streams into
//! subscribed projections, and distributors that hand out exclusive leases
//! over a pool of resources to competing workers.
//!
//! ## Core Components
//!
//! - **Catchups**: [`StreamCatchup`] (single stream), [`MultiStreamCatchup`]
//!   (stream of streams) and their distributed counterparts
//! - **Subscriptions**: [`Subscriber`] pairs an aggregator with a projection
//!   store and an optional error handler
//! - **Polling**: [`Catchup::poll`] runs a catchup on an interval until
//!   stopped
//! - **Distributor**: [`Distributor`] runs lease/receive/release loops over a
//!   [`LeaseBroker`](alluvial_core::LeaseBroker)
//!
//! ## Example
//!
//! ```
//! use alluvial_core::aggregator;
//! use alluvial_core::stream::{FnStream, Query, StreamOps};
//! use alluvial_runtime::{Catchup, StreamCatchup, Subscriber};
//!
//! # tokio_test::block_on(async {
//! let deposits = FnStream::create("deposits", |query: Query<i64>| async move {
//!     let seen = query.cursor().position().copied().unwrap_or(0);
//!     Ok(vec![5_i64, 10, 20].into_iter().skip(seen as usize).collect::<Vec<_>>())
//! });
//!
//! let catchup = StreamCatchup::new(deposits.shared());
//! let (subscriber, balances) = Subscriber::<i64, i64, i64>::in_memory(aggregator::fold(
//!     |total: i64, amount: &i64| total + amount,
//! ));
//! let _ = catchup.subscribe(subscriber);
//!
//! catchup.run_until_caught_up().await.unwrap();
//! assert_eq!(balances.find("deposits").await.unwrap().value, 35);
//! # });
//! ```

use alluvial_core::{CursorError, StoreError, StreamError};
use thiserror::Error;

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Subscribers and the type-erased subscriptions catchups hold
pub mod subscription;

/// Single-stream catchup and the `Catchup` trait
pub mod catchup;

/// Stream-of-streams catchup
pub mod multi_stream;

/// Background polling
pub mod poll;

/// In-memory lease registry and broker
pub mod memory;

/// Distributor configuration
pub mod config;

/// Lease distributor
pub mod distributor;

/// Catchups driven by a distributor, one partition per lease
pub mod distributed;

pub use catchup::{BatchOutcome, Catchup, StreamCatchup};
pub use config::{ConfigError, DistributorConfig};
pub use distributed::{DistributedCatchup, DistributedMultiStreamCatchup};
pub use distributor::{Distributor, DistributorError};
pub use memory::{InMemoryLeaseBroker, LeaseRegistry};
pub use multi_stream::MultiStreamCatchup;
pub use poll::PollHandle;
pub use retry::RetryPolicy;
pub use subscription::{AggregationFailure, Subscriber, SubscriptionHandle};

/// Errors that stop a catchup run.
///
/// Aggregation failures only surface here when the subscriber's error
/// handler did not mark them as handled.
#[derive(Error, Debug)]
pub enum CatchupError {
    /// The stream could not be fetched.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A projection or cursor store failed.
    #[error("Projection store failed: {0}")]
    Store(#[from] StoreError),

    /// A cursor rejected an advance.
    #[error(transparent)]
    Cursor(#[from] CursorError),

    /// A subscriber's aggregator failed and the failure was not handled.
    #[error("Aggregation failed for {stream_id}: {message}")]
    Aggregation {
        /// Id of the stream whose batch failed.
        stream_id: String,
        /// Rendered aggregator error, including its causes.
        message: String,
    },
}

impl CatchupError {
    pub(crate) fn aggregation(stream_id: &str, error: &anyhow::Error) -> Self {
        Self::Aggregation {
            stream_id: stream_id.to_string(),
            message: format!("{error:#}"),
        }
    }
}
