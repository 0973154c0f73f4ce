//! marketsync-storage: persistent projection backends for MarketSync.
//!
//! Backends:
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence; default)
//! - [`postgres`]: PostgreSQL via `sqlx` (`postgres` feature)
//!
//! Both implement [`ProjectionStore`](marketsync_core::ProjectionStore) and
//! [`SyncStateStore`](marketsync_core::SyncStateStore). For tests without a
//! database use [`MemoryStore`](marketsync_core::MemoryStore).

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod rows;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStore};
