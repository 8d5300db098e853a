//! `PostgreSQL` lease broker.
//!
//! Each resource is a row in `alluvial_leases`. A lease is held while the
//! row's `lease_expires` lies in the future; its `token` is the lease id, so
//! a holder whose lease expired and was re-granted cannot release or extend
//! the new holder's lease.
//!
//! Times come from the database clock so that every process agrees on them.

use crate::codec::{decode, encode};
use alluvial_core::lease::{Leasable, Lease, LeaseBroker, LeaseError, LeaseExtender};
use alluvial_core::{BoxFuture, DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

const ACQUIRE: &str = r"
UPDATE alluvial_leases AS lease
SET lease_last_granted = now(),
    lease_expires = now() + make_interval(secs => $3),
    token = $4
FROM (
    SELECT pool, resource_name
    FROM alluvial_leases
    WHERE pool = $1
      AND (lease_expires IS NULL OR lease_expires <= now())
      AND (lease_last_released IS NULL OR lease_last_released + make_interval(secs => $2) < now())
    ORDER BY lease_last_released NULLS FIRST, ordinal
    LIMIT 1
    FOR UPDATE SKIP LOCKED
) AS candidate
WHERE lease.pool = candidate.pool
  AND lease.resource_name = candidate.resource_name
RETURNING lease.resource_name, lease.resource, lease.lease_last_granted, lease.lease_last_released
";

fn broker_error(error: &impl std::fmt::Display) -> LeaseError {
    LeaseError::Broker(error.to_string())
}

#[allow(clippy::cast_precision_loss)] // lease spans are far below f64's exact range
fn seconds(span: TimeDelta) -> f64 {
    span.num_milliseconds() as f64 / 1000.0
}

/// Records extensions of leases granted by a [`PostgresLeaseBroker`].
struct LeaseRecorder {
    pool: PgPool,
    pool_name: String,
}

impl LeaseExtender for LeaseRecorder {
    fn extend<'a>(
        &'a self,
        lease_id: Uuid,
        resource_name: &'a str,
        by: TimeDelta,
    ) -> BoxFuture<'a, Result<(), LeaseError>> {
        Box::pin(async move {
            let extended = sqlx::query(
                r"
                UPDATE alluvial_leases
                SET lease_expires = lease_expires + make_interval(secs => $4)
                WHERE pool = $1 AND resource_name = $2 AND token = $3 AND lease_expires > now()
                ",
            )
            .bind(&self.pool_name)
            .bind(resource_name)
            .bind(lease_id)
            .bind(seconds(by))
            .execute(&self.pool)
            .await
            .map_err(|e| broker_error(&e))?
            .rows_affected();

            if extended == 0 {
                return Err(LeaseError::CannotExtend);
            }
            tracing::debug!(pool = %self.pool_name, resource = %resource_name, "Lease extended");
            Ok(())
        })
    }
}

/// A [`LeaseBroker`] over one pool in `alluvial_leases`.
///
/// Resources are stored as `bincode` blobs. Brokers in different processes
/// pointed at the same database and pool name compete for the same
/// resources.
pub struct PostgresLeaseBroker<R> {
    pool: PgPool,
    pool_name: String,
    recorder: Arc<LeaseRecorder>,
    _resource: PhantomData<fn() -> R>,
}

impl<R> PostgresLeaseBroker<R>
where
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// A broker over the pool named `pool_name`.
    #[must_use]
    pub fn new(pool: PgPool, pool_name: impl Into<String>) -> Self {
        let pool_name = pool_name.into();
        Self {
            recorder: Arc::new(LeaseRecorder {
                pool: pool.clone(),
                pool_name: pool_name.clone(),
            }),
            pool,
            pool_name,
            _resource: PhantomData,
        }
    }

    /// Name of the pool this broker leases from.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Add `resources` to the pool. Names already present keep their row and
    /// history.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Broker`] if a resource cannot be encoded or
    /// inserted.
    pub async fn register(&self, resources: impl IntoIterator<Item = Leasable<R>>) -> Result<(), LeaseError> {
        let mut tx = self.pool.begin().await.map_err(|e| broker_error(&e))?;
        for resource in resources {
            let bytes = encode(&resource.resource).map_err(|e| broker_error(&e))?;
            sqlx::query(
                r"
                INSERT INTO alluvial_leases (pool, resource_name, resource, lease_last_granted, lease_last_released)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (pool, resource_name) DO NOTHING
                ",
            )
            .bind(&self.pool_name)
            .bind(&resource.name)
            .bind(bytes)
            .bind(resource.lease_last_granted)
            .bind(resource.lease_last_released)
            .execute(&mut *tx)
            .await
            .map_err(|e| broker_error(&e))?;
        }
        tx.commit().await.map_err(|e| broker_error(&e))?;
        Ok(())
    }

    /// Every resource in the pool, in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Broker`] if the query fails or a row cannot be
    /// decoded.
    pub async fn snapshot(&self) -> Result<Vec<Leasable<R>>, LeaseError> {
        let rows = sqlx::query(
            r"
            SELECT resource_name, resource, lease_last_granted, lease_last_released
            FROM alluvial_leases
            WHERE pool = $1
            ORDER BY ordinal
            ",
        )
        .bind(&self.pool_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| broker_error(&e))?;

        rows.iter().map(Self::row_to_leasable).collect()
    }

    fn row_to_leasable(row: &PgRow) -> Result<Leasable<R>, LeaseError> {
        let name: String = row.try_get("resource_name").map_err(|e| broker_error(&e))?;
        let bytes: Vec<u8> = row.try_get("resource").map_err(|e| broker_error(&e))?;
        let last_granted: Option<DateTime<Utc>> =
            row.try_get("lease_last_granted").map_err(|e| broker_error(&e))?;
        let last_released: Option<DateTime<Utc>> =
            row.try_get("lease_last_released").map_err(|e| broker_error(&e))?;

        Ok(Leasable {
            resource: decode(&bytes).map_err(|e| broker_error(&e))?,
            name,
            lease_last_granted: last_granted,
            lease_last_released: last_released,
        })
    }

    async fn try_acquire(&self, duration: TimeDelta, cooldown: TimeDelta) -> Result<Option<Lease<R>>, LeaseError> {
        if duration <= TimeDelta::zero() {
            return Err(LeaseError::InvalidDuration {
                duration: duration.to_string(),
            });
        }

        let token = Uuid::new_v4();
        let row = sqlx::query(ACQUIRE)
            .bind(&self.pool_name)
            .bind(seconds(cooldown))
            .bind(seconds(duration))
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| broker_error(&e))?;

        let Some(row) = row else {
            metrics::counter!("postgres_lease_acquire_total", "outcome" => "none").increment(1);
            return Ok(None);
        };

        let leasable = Self::row_to_leasable(&row)?;
        let recorder: Arc<dyn LeaseExtender> = self.recorder.clone();
        let lease = Lease::grant_extendable(token, &leasable, duration, recorder)?;

        metrics::counter!("postgres_lease_acquire_total", "outcome" => "granted").increment(1);
        tracing::debug!(pool = %self.pool_name, resource = %leasable.name, "Lease granted");
        Ok(Some(lease))
    }

    async fn finish(&self, lease: &Lease<R>) -> Result<(), LeaseError> {
        let released = sqlx::query(
            r"
            UPDATE alluvial_leases
            SET lease_last_released = now(), lease_expires = NULL, token = NULL
            WHERE pool = $1 AND resource_name = $2 AND token = $3
            ",
        )
        .bind(&self.pool_name)
        .bind(lease.name())
        .bind(lease.id())
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error(&e))?
        .rows_affected();

        if released == 0 {
            tracing::debug!(
                pool = %self.pool_name,
                resource = %lease.name(),
                "Lease was superseded, ignoring release"
            );
        } else {
            tracing::debug!(pool = %self.pool_name, resource = %lease.name(), "Lease released");
        }
        Ok(())
    }
}

impl<R> LeaseBroker<R> for PostgresLeaseBroker<R>
where
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn pool_size(&self) -> BoxFuture<'_, Result<usize, LeaseError>> {
        Box::pin(async move {
            let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alluvial_leases WHERE pool = $1")
                .bind(&self.pool_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| broker_error(&e))?;
            Ok(usize::try_from(count.0).unwrap_or(0))
        })
    }

    fn acquire(
        &self,
        duration: TimeDelta,
        cooldown: TimeDelta,
    ) -> BoxFuture<'_, Result<Option<Lease<R>>, LeaseError>> {
        Box::pin(self.try_acquire(duration, cooldown))
    }

    fn release<'a>(&'a self, lease: &'a Lease<R>) -> BoxFuture<'a, Result<(), LeaseError>> {
        Box::pin(self.finish(lease))
    }
}
