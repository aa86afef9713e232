//! Canonical records that travel through the broker and land in storage.

use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::number::BlockNumber;

// ─── CrawlRequest ─────────────────────────────────────────────────────────────

/// A unit of work on the request topic: "fetch and persist this block".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRequest {
    #[serde(rename = "block_num")]
    pub block_number: BlockNumber,
    /// Set when the request was issued by reconciliation after the block
    /// left the unstable window.
    #[serde(default)]
    pub is_stable: bool,
}

impl CrawlRequest {
    pub fn new(block_number: impl Into<BlockNumber>, is_stable: bool) -> Self {
        Self {
            block_number: block_number.into(),
            is_stable,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a JSON request.
    pub fn decode(payload: &[u8]) -> Result<Self, SyncError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Decodes a JSON request, or, when `accept_legacy` is set and the payload
    /// is not a JSON object, a bare big-endian block number.
    pub fn decode_with(payload: &[u8], accept_legacy: bool) -> Result<Self, SyncError> {
        if accept_legacy && payload.first() != Some(&b'{') {
            if payload.is_empty() {
                return Err(SyncError::Decode("empty crawl request".into()));
            }
            return Ok(Self::new(BlockNumber::from_be_slice(payload)?, false));
        }
        Self::decode(payload)
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block with its transactions, as persisted by the database writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "block_num")]
    pub block_number: BlockNumber,
    pub block_hash: String,
    /// Unix timestamp (seconds).
    pub block_time: u64,
    pub parent_hash: String,
    #[serde(default)]
    pub is_stable: bool,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The header-only record written before the full block is persisted.
    /// Always unstable, never carries transactions.
    pub fn provisional(&self) -> Block {
        Block {
            block_number: self.block_number,
            block_hash: self.block_hash.clone(),
            block_time: self.block_time,
            parent_hash: self.parent_hash.clone(),
            is_stable: false,
            transactions: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SyncError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn log_count(&self) -> usize {
        self.transactions.iter().map(|t| t.logs.len()).sum()
    }
}

// ─── Transaction ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_hash: String,
    #[serde(rename = "block_num")]
    pub block_number: BlockNumber,
    pub from: String,
    /// `None` for contract creation.
    #[serde(default)]
    pub to: Option<String>,
    pub nonce: u64,
    pub value: BlockNumber,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub logs: Vec<TransactionLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLog {
    /// Assigned by storage; absent until the log has been persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub tx_hash: String,
    pub index: u64,
    #[serde(default)]
    pub data: Bytes,
}

// ─── CurrentBlockNumber ───────────────────────────────────────────────────────

/// The scheduler's persisted cursor. Exactly one row (`id = 1`) exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentBlockNumber {
    pub id: i64,
    #[serde(rename = "block_num")]
    pub block_number: BlockNumber,
    /// Chain head observed when the cursor was last written.
    #[serde(rename = "online_block_num")]
    pub online_block_number: BlockNumber,
}

impl CurrentBlockNumber {
    pub const ROW_ID: i64 = 1;

    pub fn new(block_number: BlockNumber, online_block_number: BlockNumber) -> Self {
        Self {
            id: Self::ROW_ID,
            block_number,
            online_block_number,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
