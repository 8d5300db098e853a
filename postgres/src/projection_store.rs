//! `PostgreSQL` projection store.

use crate::codec::{decode, encode, storage};
use alluvial_core::cursor::{Cursor, CursorPosition};
use alluvial_core::projection::{Projection, ProjectionStore, StoreError};
use alluvial_core::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use std::marker::PhantomData;
use std::sync::Arc;

type ValueFactory<V> = Arc<dyn Fn(&str) -> V + Send + Sync>;

/// Projections stored in `alluvial_projections`, one row per stream key.
///
/// Several projections can share the table: rows are namespaced by the
/// projection name given to [`new`](Self::new).
pub struct PostgresProjectionStore<V, P> {
    pool: PgPool,
    projection: String,
    factory: ValueFactory<V>,
    _position: PhantomData<fn() -> P>,
}

impl<V, P> Clone for PostgresProjectionStore<V, P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            projection: self.projection.clone(),
            factory: Arc::clone(&self.factory),
            _position: PhantomData,
        }
    }
}

impl<V, P> PostgresProjectionStore<V, P>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: CursorPosition + Serialize + DeserializeOwned,
{
    /// A store for `projection`, creating missing values with
    /// `V::default()`.
    #[must_use]
    pub fn new(pool: PgPool, projection: impl Into<String>) -> Self
    where
        V: Default,
    {
        Self::with_factory(pool, projection, |_| V::default())
    }

    /// A store for `projection`, creating missing values with
    /// `factory(key)`.
    #[must_use]
    pub fn with_factory(
        pool: PgPool,
        projection: impl Into<String>,
        factory: impl Fn(&str) -> V + Send + Sync + 'static,
    ) -> Self {
        Self {
            pool,
            projection: projection.into(),
            factory: Arc::new(factory),
            _position: PhantomData,
        }
    }

    /// Name the rows are stored under.
    #[must_use]
    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// The stored projection for `key`, without creating one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the row cannot be
    /// decoded.
    pub async fn find(&self, key: &str) -> Result<Option<Projection<V, P>>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT value, cursor
            FROM alluvial_projections
            WHERE projection = $1 AND key = $2
            ",
        )
        .bind(&self.projection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: Vec<u8> = row.try_get("value").map_err(|e| storage(&e))?;
        let cursor: Vec<u8> = row.try_get("cursor").map_err(|e| storage(&e))?;
        Ok(Some(Projection::with_cursor(
            decode(&value)?,
            decode::<Cursor<P>>(&cursor)?,
        )))
    }

    /// Delete every row of this projection, for rebuilding it from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the delete fails.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM alluvial_projections WHERE projection = $1")
            .bind(&self.projection)
            .execute(&self.pool)
            .await
            .map_err(|e| storage(&e))?
            .rows_affected();

        tracing::info!(projection = %self.projection, deleted, "Projection cleared");
        Ok(deleted)
    }
}

impl<V, P> ProjectionStore<V, P> for PostgresProjectionStore<V, P>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: CursorPosition + Serialize + DeserializeOwned,
{
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Projection<V, P>, StoreError>> {
        Box::pin(async move {
            match self.find(key).await? {
                Some(projection) => Ok(projection),
                None => Ok(Projection::new((self.factory)(key))),
            }
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        projection: Projection<V, P>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let value = encode(&projection.value)?;
            let cursor = encode(&projection.cursor.writable())?;

            sqlx::query(
                r"
                INSERT INTO alluvial_projections (projection, key, value, cursor)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (projection, key)
                DO UPDATE SET value = EXCLUDED.value, cursor = EXCLUDED.cursor, updated_at = now()
                ",
            )
            .bind(&self.projection)
            .bind(key)
            .bind(value)
            .bind(cursor)
            .execute(&self.pool)
            .await
            .map_err(|e| storage(&e))?;

            tracing::trace!(projection = %self.projection, key, "Projection stored");
            Ok(())
        })
    }
}
