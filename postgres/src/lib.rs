//! `PostgreSQL` adapters for Alluvial.
//!
//! - [`PostgresLeaseBroker`]: lease pools shared across processes. Acquiring
//!   is a single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`
//!   statement, so competing brokers never grant the same resource twice.
//! - [`PostgresProjectionStore`]: projections with their cursors.
//! - [`PostgresCursorStore`]: named cursors, for multi-stream upstreams.
//!
//! Values, cursors and resources are stored as `bincode` blobs. Run
//! [`schema::migrate`] once before use.
//!
//! # Example
//!
//! ```no_run
//! use alluvial_core::Leasable;
//! use alluvial_postgres::{PostgresLeaseBroker, schema};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/alluvial").await?;
//! schema::migrate(&pool).await?;
//!
//! let broker = PostgresLeaseBroker::<u32>::new(pool, "shards");
//! broker.register((0..8).map(|shard| Leasable::new(format!("shard-{shard}"), shard))).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
pub mod cursor_store;
pub mod lease_broker;
pub mod projection_store;
pub mod schema;

pub use cursor_store::PostgresCursorStore;
pub use lease_broker::PostgresLeaseBroker;
pub use projection_store::PostgresProjectionStore;
