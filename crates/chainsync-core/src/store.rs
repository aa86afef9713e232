//! Storage capability: blocks, transactions and the scheduler cursor.
//!
//! Writes are upserts: persisting a block whose number already exists
//! overwrites every field, so the last writer for a block number wins.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::number::BlockNumber;
use crate::types::{Block, CurrentBlockNumber, Transaction};

/// Trait for block persistence backends.
///
/// Implementations include `MemoryStore` and `PostgresStore`.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Load the scheduler cursor row. `SyncError::NotFound` before migrations ran.
    async fn current_block_number(&self) -> Result<CurrentBlockNumber, SyncError>;

    /// Overwrite the cursor and the last observed chain head.
    async fn update_current_block_number(
        &self,
        block_number: BlockNumber,
        online_block_number: BlockNumber,
    ) -> Result<(), SyncError>;

    /// Load a block with its transactions and their logs.
    async fn get_block(&self, block_number: BlockNumber) -> Result<Option<Block>, SyncError>;

    /// Newest blocks first, headers only.
    async fn list_blocks(&self, limit: usize) -> Result<Vec<Block>, SyncError>;

    /// Insert or fully update a block, its transactions and logs atomically.
    async fn upsert_block(&self, block: &Block) -> Result<(), SyncError>;

    /// Insert or update only the header columns of a block. Transactions are
    /// left untouched.
    async fn upsert_block_header(&self, block: &Block) -> Result<(), SyncError>;

    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<Transaction>, SyncError>;

    /// Apply every pending migration.
    async fn migrate_up(&self) -> Result<(), SyncError>;

    /// Roll back every applied migration.
    async fn migrate_down(&self) -> Result<(), SyncError>;

    /// Migrate forward or backward so that `version` is the latest applied.
    async fn migrate_to(&self, version: &str) -> Result<(), SyncError>;

    async fn close(&self) -> Result<(), SyncError>;
}
