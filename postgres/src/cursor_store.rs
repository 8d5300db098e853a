//! `PostgreSQL` cursor store.

use crate::codec::{decode, encode, storage};
use alluvial_core::cursor::{Cursor, CursorPosition};
use alluvial_core::projection::{CursorStore, StoreError};
use alluvial_core::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use std::marker::PhantomData;

/// Named cursors stored in `alluvial_cursors`.
pub struct PostgresCursorStore<P> {
    pool: PgPool,
    _position: PhantomData<fn() -> P>,
}

impl<P> Clone for PostgresCursorStore<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _position: PhantomData,
        }
    }
}

impl<P> PostgresCursorStore<P> {
    /// A store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _position: PhantomData,
        }
    }
}

impl<P> CursorStore<P> for PostgresCursorStore<P>
where
    P: CursorPosition + Serialize + DeserializeOwned,
{
    fn load<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Cursor<P>>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT cursor FROM alluvial_cursors WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage(&e))?;

            match row {
                Some(row) => {
                    let bytes: Vec<u8> = row.try_get("cursor").map_err(|e| storage(&e))?;
                    Ok(Some(decode(&bytes)?))
                }
                None => Ok(None),
            }
        })
    }

    fn save<'a>(&'a self, name: &'a str, cursor: &'a Cursor<P>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let bytes = encode(&cursor.writable())?;
            sqlx::query(
                r"
                INSERT INTO alluvial_cursors (name, cursor)
                VALUES ($1, $2)
                ON CONFLICT (name) DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = now()
                ",
            )
            .bind(name)
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(|e| storage(&e))?;
            Ok(())
        })
    }
}
