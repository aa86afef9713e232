//! Read path over stored blocks.
//!
//! Reading an unstable block that has left the unstable window triggers a
//! stable re-crawl through the [`Reconciler`]. The caller still gets the
//! block as currently stored.

use std::sync::Arc;

use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};

use chainsync_core::error::SyncError;
use chainsync_core::number::BlockNumber;
use chainsync_core::reconcile::Reconciler;
use chainsync_core::store::BlockStore;
use chainsync_core::types::{Block, Transaction};

#[derive(Clone)]
pub struct BlockQuery {
    store: Arc<dyn BlockStore>,
    reconciler: Reconciler,
    default_limit: usize,
}

impl BlockQuery {
    pub fn new(store: Arc<dyn BlockStore>, reconciler: Reconciler, default_limit: usize) -> Self {
        Self {
            store,
            reconciler,
            default_limit,
        }
    }

    pub async fn get_block(&self, block_number: BlockNumber) -> Result<Option<Block>, SyncError> {
        let block = self.store.get_block(block_number).await?;
        if let Some(block) = &block {
            if !block.is_stable {
                self.reconciler.compensate(block).await;
            }
        }
        Ok(block)
    }

    /// Newest blocks first; `None` uses the configured default limit.
    pub async fn list_blocks(&self, limit: Option<usize>) -> Result<Vec<Block>, SyncError> {
        self.store
            .list_blocks(limit.unwrap_or(self.default_limit))
            .await
    }

    pub async fn get_transaction(&self, tx_hash: &str) -> Result<Option<Transaction>, SyncError> {
        self.store.get_transaction(tx_hash).await
    }
}

// ─── Response shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderView {
    pub block_num: BlockNumber,
    pub block_hash: String,
    pub block_time: u64,
    pub parent_hash: String,
    pub is_stable: bool,
}

impl From<&Block> for BlockHeaderView {
    fn from(block: &Block) -> Self {
        Self {
            block_num: block.block_number,
            block_hash: block.block_hash.clone(),
            block_time: block.block_time,
            parent_hash: block.parent_hash.clone(),
            is_stable: block.is_stable,
        }
    }
}

/// `GET /blocks` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockList {
    #[serde(rename = "block")]
    pub blocks: Vec<BlockHeaderView>,
}

impl From<&[Block]> for BlockList {
    fn from(blocks: &[Block]) -> Self {
        Self {
            blocks: blocks.iter().map(BlockHeaderView::from).collect(),
        }
    }
}

/// A block with its transaction hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockView {
    #[serde(flatten)]
    pub header: BlockHeaderView,
    pub transactions: Vec<String>,
}

impl From<&Block> for BlockView {
    fn from(block: &Block) -> Self {
        Self {
            header: BlockHeaderView::from(block),
            transactions: block.transactions.iter().map(|t| t.tx_hash.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogView {
    pub index: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionView {
    pub tx_hash: String,
    pub from: String,
    pub to: Option<String>,
    pub nonce: u64,
    pub data: Bytes,
    pub value: BlockNumber,
    pub logs: Vec<LogView>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        Self {
            tx_hash: tx.tx_hash.clone(),
            from: tx.from.clone(),
            to: tx.to.clone(),
            nonce: tx.nonce,
            data: tx.data.clone(),
            value: tx.value,
            logs: tx
                .logs
                .iter()
                .map(|l| LogView {
                    index: l.index,
                    data: l.data.clone(),
                })
                .collect(),
        }
    }
}
