//! Tables used by the `PostgreSQL` adapters.
//!
//! [`migrate`] creates them if they do not exist. Every statement is
//! idempotent, so calling it on every start is fine.

use sqlx::PgPool;

/// Leasable resources, one row per resource per pool.
pub const LEASES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS alluvial_leases (
    ordinal BIGSERIAL,
    pool TEXT NOT NULL,
    resource_name TEXT NOT NULL,
    resource BYTEA NOT NULL,
    lease_last_granted TIMESTAMPTZ,
    lease_last_released TIMESTAMPTZ,
    lease_expires TIMESTAMPTZ,
    token UUID,
    PRIMARY KEY (pool, resource_name)
)
";

/// Projection values with their cursors, keyed by projection and stream.
pub const PROJECTIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS alluvial_projections (
    projection TEXT NOT NULL,
    key TEXT NOT NULL,
    value BYTEA NOT NULL,
    cursor BYTEA NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (projection, key)
)
";

/// Named cursors.
pub const CURSORS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS alluvial_cursors (
    name TEXT PRIMARY KEY,
    cursor BYTEA NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
";

const LEASES_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_alluvial_leases_released
    ON alluvial_leases (pool, lease_last_released NULLS FIRST, ordinal)
";

/// Create the lease, projection and cursor tables.
///
/// # Errors
///
/// Returns the database error if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for statement in [LEASES_TABLE, LEASES_INDEX, PROJECTIONS_TABLE, CURSORS_TABLE] {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!("Alluvial schema is up to date");
    Ok(())
}
