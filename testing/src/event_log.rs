//! In-memory event log fixture.
//!
//! Events are appended per aggregate. Each aggregate has its own stream,
//! positioned by the event's sequence within the aggregate, and the log as a
//! whole has an index stream positioned by global sequence that yields the
//! stream of the aggregate each new event belongs to.

use alluvial_core::stream::{FnStream, Query, SharedStream, StreamOps};
use std::sync::{Arc, PoisonError, RwLock};

/// One appended event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event<T> {
    /// The aggregate the event belongs to.
    pub aggregate_id: String,
    /// 1-based position within the aggregate.
    pub sequence: i64,
    /// 1-based position within the whole log.
    pub global_sequence: i64,
    /// The event data.
    pub payload: T,
}

/// An append-only, in-memory event log.
///
/// Clones share the same events.
#[derive(Debug)]
pub struct InMemoryEventLog<T> {
    events: Arc<RwLock<Vec<Event<T>>>>,
}

impl<T> Clone for InMemoryEventLog<T> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<T> Default for InMemoryEventLog<T> {
    fn default() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<T> InMemoryEventLog<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `payload` to `aggregate_id`, returning the stored event.
    pub fn append(&self, aggregate_id: impl Into<String>, payload: T) -> Event<T> {
        let aggregate_id = aggregate_id.into();
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let sequence = events
            .iter()
            .rev()
            .find(|event| event.aggregate_id == aggregate_id)
            .map_or(1, |event| event.sequence + 1);
        let event = Event {
            aggregate_id,
            sequence,
            global_sequence: next_position(events.len()),
            payload,
        };
        events.push(event.clone());
        event
    }

    /// Number of events in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every event in the log, in order.
    #[must_use]
    pub fn events(&self) -> Vec<Event<T>> {
        self.events.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every event for `aggregate_id`, in order.
    #[must_use]
    pub fn events_for(&self, aggregate_id: &str) -> Vec<Event<T>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    /// The stream of one aggregate's events, with id `aggregate_id`.
    #[must_use]
    pub fn aggregate_stream(&self, aggregate_id: &str) -> SharedStream<Event<T>, i64> {
        let events = Arc::clone(&self.events);
        let id = aggregate_id.to_string();
        FnStream::create_positioned(
            aggregate_id,
            move |query: Query<i64>| {
                let after = query.cursor().position().copied().unwrap_or(0);
                let found: Vec<Event<T>> = events
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .filter(|event| event.aggregate_id == id && event.sequence > after)
                    .take(query.batch_size().unwrap_or(usize::MAX))
                    .cloned()
                    .collect();
                async move { Ok(found) }
            },
            |event: &Event<T>| event.sequence,
        )
        .shared()
    }

    /// A stream with one item per event appended after the cursor: the
    /// stream of that event's aggregate. Positioned by global sequence.
    #[must_use]
    pub fn index_stream(&self, id: &str) -> SharedStream<SharedStream<Event<T>, i64>, i64> {
        let events = Arc::clone(&self.events);
        let log = self.clone();
        FnStream::create_positioned(
            id,
            move |query: Query<i64>| {
                let after = query.cursor().position().copied().unwrap_or(0);
                let found: Vec<(String, i64)> = events
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .filter(|event| event.global_sequence > after)
                    .take(query.batch_size().unwrap_or(usize::MAX))
                    .map(|event| (event.aggregate_id.clone(), event.global_sequence))
                    .collect();
                async move { Ok(found) }
            },
            |(_, global): &(String, i64)| *global,
        )
        .requery(move |(aggregate_id, _)| log.aggregate_stream(&aggregate_id))
        .shared()
    }
}

fn next_position(len: usize) -> i64 {
    i64::try_from(len).map_or(i64::MAX, |len| len + 1)
}
