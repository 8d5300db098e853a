//! # Alluvial Core
//!
//! Core types for incrementally replaying append-only streams into
//! projections, and for spreading that work across competing workers with
//! exclusive, time-bounded leases.
//!
//! ## Core Concepts
//!
//! - **Cursor**: Typed, monotonic position marker over an ordered domain
//! - **Stream**: Pull source answering "what comes after this cursor?"
//! - **Batch**: Finite slice of stream data, each item paired with its position
//! - **Aggregator**: Folds a batch into a projection; composable as middleware
//! - **Projection**: User state plus the cursor it has been brought up to
//! - **Partition**: Disjoint slice of a key domain (ranges or single values)
//! - **Lease**: Exclusive, expiring, renewable grant over one resource
//!
//! The engines that drive these (catchups, distributors) live in
//! `alluvial-runtime`; SQL-backed stores and brokers live in
//! `alluvial-postgres`.
//!
//! ## Example
//!
//! ```
//! use alluvial_core::aggregator::{self, Aggregator};
//! use alluvial_core::stream::{FnStream, Query, Stream};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let deposits = FnStream::create("deposits", |query: Query<i64>| async move {
//!     let seen = query.cursor().position().copied().unwrap_or(0);
//!     Ok(vec![5_i64, 10, 20].into_iter().skip(seen as usize).collect::<Vec<_>>())
//! });
//! let balance = aggregator::fold(|total: i64, amount: &i64| total + amount);
//!
//! let mut query = Query::new(deposits.new_cursor());
//! let batch = Arc::new(deposits.fetch(&mut query).await.unwrap());
//! assert_eq!(balance.aggregate(0, batch).await.unwrap(), 35);
//! # });
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, TimeDelta, Utc};
pub use futures::future::BoxFuture;
pub use serde::{Deserialize, Serialize};

pub mod aggregator;
pub mod cursor;
pub mod guid;
pub mod lease;
pub mod partition;
pub mod position;
pub mod projection;
pub mod stream;

pub use aggregator::{Aggregator, AggregatorExt, SharedAggregator};
pub use cursor::{Cursor, CursorError, CursorPosition, Incrementable};
pub use lease::{Leasable, Lease, LeaseBroker, LeaseError, LeaseExtender, SharedLeaseBroker};
pub use partition::{Partition, PartitionError, RangePartition, ValuePartition};
pub use projection::{
    CursorStore, InMemoryCursorStore, InMemoryProjectionStore, Projection, ProjectionStore,
    SharedCursorStore, SharedProjectionStore, StoreError,
};
pub use stream::{Batch, Query, SharedStream, Stream, StreamError, StreamOps};

/// Environment module - injected dependencies
///
/// Leases and brokers read the time through [`environment::Clock`] so tests
/// can pin or advance it.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use alluvial_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
