//! Projections and their storage contracts.
//!
//! A [`Projection`] pairs arbitrary user state with the cursor recording how
//! far through its stream that state has been brought. Stores persist both
//! together so that a restarted catchup resumes where it stopped and never
//! re-applies data.
//!
//! # Storage contracts
//!
//! - [`ProjectionStore`]: `get` (creates on miss) and `put` by key. Catchups
//!   key projections by stream id.
//! - [`CursorStore`]: `load` and `save` a bare cursor by name. Multi-stream
//!   and distributed catchups keep their upstream cursors here.
//!
//! Both come with in-memory defaults; `alluvial-postgres` provides SQL-backed
//! implementations.

use crate::cursor::{Cursor, CursorPosition};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Error type for projection and cursor storage.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Projection state together with its cursor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection<V, P> {
    /// User state.
    pub value: V,
    /// How far through the stream `value` reflects.
    pub cursor: Cursor<P>,
}

impl<V, P: CursorPosition> Projection<V, P> {
    /// A projection at the start of its stream.
    #[must_use]
    pub const fn new(value: V) -> Self {
        Self {
            value,
            cursor: Cursor::new(),
        }
    }

    /// A projection with a known cursor.
    #[must_use]
    pub const fn with_cursor(value: V, cursor: Cursor<P>) -> Self {
        Self { value, cursor }
    }
}

/// Keyed storage for projections.
pub trait ProjectionStore<V, P>: Send + Sync {
    /// Load the projection stored under `key`, creating a fresh one on miss.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Projection<V, P>, StoreError>>;

    /// Store `projection` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn put<'a>(
        &'a self,
        key: &'a str,
        projection: Projection<V, P>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// A type-erased, shareable projection store.
pub type SharedProjectionStore<V, P> = Arc<dyn ProjectionStore<V, P>>;

type ValueFactory<V> = Arc<dyn Fn(&str) -> V + Send + Sync>;

/// In-memory projection store.
///
/// Clones share the same map, so a test can keep a handle while a catchup
/// writes through another.
pub struct InMemoryProjectionStore<V, P> {
    projections: Arc<RwLock<HashMap<String, Projection<V, P>>>>,
    factory: ValueFactory<V>,
}

impl<V, P> Clone for InMemoryProjectionStore<V, P> {
    fn clone(&self) -> Self {
        Self {
            projections: Arc::clone(&self.projections),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<V, P> InMemoryProjectionStore<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: CursorPosition,
{
    /// A store creating missing projections with `V::default()`.
    #[must_use]
    pub fn new() -> Self
    where
        V: Default,
    {
        Self::with_factory(|_| V::default())
    }

    /// A store creating missing projections with `factory(key)`.
    #[must_use]
    pub fn with_factory(factory: impl Fn(&str) -> V + Send + Sync + 'static) -> Self {
        Self {
            projections: Arc::new(RwLock::new(HashMap::new())),
            factory: Arc::new(factory),
        }
    }

    /// Number of stored projections.
    pub async fn len(&self) -> usize {
        self.projections.read().await.len()
    }

    /// Whether nothing has been stored yet.
    pub async fn is_empty(&self) -> bool {
        self.projections.read().await.is_empty()
    }

    /// Copies of every stored projection.
    pub async fn entries(&self) -> Vec<(String, Projection<V, P>)> {
        self.projections
            .read()
            .await
            .iter()
            .map(|(key, projection)| (key.clone(), projection.clone()))
            .collect()
    }

    /// The stored projection for `key`, without creating one.
    pub async fn find(&self, key: &str) -> Option<Projection<V, P>> {
        self.projections.read().await.get(key).cloned()
    }
}

impl<V, P> Default for InMemoryProjectionStore<V, P>
where
    V: Clone + Default + Send + Sync + 'static,
    P: CursorPosition,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, P> ProjectionStore<V, P> for InMemoryProjectionStore<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: CursorPosition,
{
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Projection<V, P>, StoreError>> {
        Box::pin(async move {
            if let Some(existing) = self.projections.read().await.get(key) {
                return Ok(existing.clone());
            }
            Ok(Projection::new((self.factory)(key)))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        projection: Projection<V, P>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.projections
                .write()
                .await
                .insert(key.to_string(), projection);
            Ok(())
        })
    }
}

/// Named storage for bare cursors.
pub trait CursorStore<P>: Send + Sync {
    /// The cursor saved under `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn load<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Cursor<P>>, StoreError>>;

    /// Save `cursor` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn save<'a>(&'a self, name: &'a str, cursor: &'a Cursor<P>) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// A type-erased, shareable cursor store.
pub type SharedCursorStore<P> = Arc<dyn CursorStore<P>>;

/// In-memory cursor store.
#[derive(Debug)]
pub struct InMemoryCursorStore<P> {
    cursors: Arc<RwLock<HashMap<String, Cursor<P>>>>,
}

impl<P> Clone for InMemoryCursorStore<P> {
    fn clone(&self) -> Self {
        Self {
            cursors: Arc::clone(&self.cursors),
        }
    }
}

impl<P: CursorPosition> InMemoryCursorStore<P> {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursors: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<P: CursorPosition> Default for InMemoryCursorStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CursorPosition> CursorStore<P> for InMemoryCursorStore<P> {
    fn load<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Cursor<P>>, StoreError>> {
        Box::pin(async move { Ok(self.cursors.read().await.get(name).cloned()) })
    }

    fn save<'a>(&'a self, name: &'a str, cursor: &'a Cursor<P>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.cursors
                .write()
                .await
                .insert(name.to_string(), cursor.writable());
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_creates_missing_projections_without_storing_them() {
        let store = InMemoryProjectionStore::<String, i64>::with_factory(|key| format!("new:{key}"));

        let projection = store.get("account-1").await.unwrap();
        assert_eq!(projection.value, "new:account-1");
        assert_eq!(projection.cursor.position(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn put_overwrites_and_clones_share_state() {
        let store = InMemoryProjectionStore::<i64, i64>::new();
        let handle = store.clone();

        store
            .put("a", Projection::with_cursor(10, Cursor::at(3)))
            .await
            .unwrap();
        store
            .put("a", Projection::with_cursor(15, Cursor::at(4)))
            .await
            .unwrap();

        let stored = handle.get("a").await.unwrap();
        assert_eq!(stored.value, 15);
        assert_eq!(stored.cursor.position(), Some(&4));
        assert_eq!(handle.len().await, 1);
        assert_eq!(handle.find("b").await, None);
    }

    #[tokio::test]
    async fn cursor_store_keeps_direction_and_drops_read_only() {
        let store = InMemoryCursorStore::<i64>::new();
        assert!(store.load("upstream").await.unwrap().is_none());

        let snapshot = Cursor::at(42).descending().read_only();
        store.save("upstream", &snapshot).await.unwrap();

        let mut loaded = store.load("upstream").await.unwrap().unwrap();
        assert!(!loaded.ascending());
        assert!(!loaded.is_read_only());
        loaded.advance_to(41).unwrap();
        assert_eq!(loaded.position(), Some(&41));
    }

    #[tokio::test]
    async fn projections_serialize_with_their_cursor() {
        let projection = Projection::with_cursor(vec![1, 2], Cursor::at(2_i64));
        let json = serde_json::to_value(&projection).unwrap();

        assert_eq!(json["value"], serde_json::json!([1, 2]));
        assert_eq!(json["cursor"]["position"], serde_json::json!(2));
        let back: Projection<Vec<i32>, i64> = serde_json::from_value(json).unwrap();
        assert_eq!(back, projection);
    }
}
