//! # Alluvial Testing
//!
//! Fixtures for testing catchups and distributors.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - An in-memory event log with per-aggregate streams and a global index
//!   stream ([`InMemoryEventLog`])
//! - Aggregators that record what they were given
//! - [`init_tracing`] for readable test output
//!
//! ## Example
//!
//! ```
//! use alluvial_core::stream::{Query, Stream};
//! use alluvial_testing::InMemoryEventLog;
//!
//! # tokio_test::block_on(async {
//! let log = InMemoryEventLog::new();
//! log.append("account-1", 100_i64);
//! log.append("account-1", -30);
//!
//! let stream = log.aggregate_stream("account-1");
//! let mut query = Query::new(stream.new_cursor());
//! let batch = stream.fetch(&mut query).await.unwrap();
//! assert_eq!(batch.len(), 2);
//! assert_eq!(query.cursor().position(), Some(&2));
//! # });
//! ```

use alluvial_core::environment::Clock;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Mutex, PoisonError};

pub mod aggregators;
pub mod event_log;

pub use aggregators::{CountingAggregator, RecordingAggregator};
pub use event_log::{Event, InMemoryEventLog};

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Mutex, PoisonError, TimeDelta, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use alluvial_testing::mocks::FixedClock;
    /// use alluvial_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// A clock that only moves when told to.
    ///
    /// ```
    /// use alluvial_testing::mocks::ManualClock;
    /// use alluvial_core::environment::Clock;
    /// use chrono::TimeDelta;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(TimeDelta::seconds(5));
    /// assert_eq!(clock.now() - start, TimeDelta::seconds(5));
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// A clock reading `time` until advanced.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: TimeDelta) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_time())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_time() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_time())
    }
}

/// Install a `tracing` subscriber writing to the test harness.
///
/// Filtering follows `RUST_LOG`, defaulting to `warn`. Safe to call from
/// every test; only the first call installs anything.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // another test may have installed one already
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
