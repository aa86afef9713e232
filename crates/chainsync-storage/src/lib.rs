//! chainsync-storage: pluggable [`BlockStore`] backends.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - `postgres`: PostgreSQL via `sqlx` (feature `postgres`)
//!
//! Both share the versioned migrations in [`migration`].

use std::sync::Arc;

use chainsync_core::config::{DatabaseConfig, StorageDriver};
use chainsync_core::error::SyncError;
use chainsync_core::store::BlockStore;

pub mod memory;
pub mod migration;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Open the backend selected by `config.driver`.
///
/// The memory backend lives only as long as the process, so it comes up
/// with its schema already migrated.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn BlockStore>, SyncError> {
    match config.driver {
        StorageDriver::Memory => Ok(Arc::new(MemoryStore::with_schema())),
        #[cfg(feature = "postgres")]
        StorageDriver::Postgres => Ok(Arc::new(PostgresStore::connect(config).await?)),
        #[cfg(not(feature = "postgres"))]
        StorageDriver::Postgres => Err(SyncError::Config(
            "database.driver = postgres requires the `postgres` feature".into(),
        )),
    }
}
