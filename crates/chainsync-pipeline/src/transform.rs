//! Assembly of canonical records from raw node responses.

use chainsync_core::chain::{ChainBlock, ChainReceipt, ChainTransaction};
use chainsync_core::types::{Block, Transaction, TransactionLog};

/// Header of `raw`, without transactions.
pub fn block_header(raw: &ChainBlock, is_stable: bool) -> Block {
    Block {
        block_number: raw.number,
        block_hash: raw.hash.clone(),
        block_time: raw.timestamp,
        parent_hash: raw.parent_hash.clone(),
        is_stable,
        transactions: Vec::new(),
    }
}

/// Canonical transaction for `raw`, with logs taken from its receipt.
pub fn transaction(
    raw: &ChainTransaction,
    block: &ChainBlock,
    from: String,
    receipt: &ChainReceipt,
) -> Transaction {
    let logs = receipt
        .logs
        .iter()
        .map(|log| TransactionLog {
            id: None,
            tx_hash: log
                .transaction_hash
                .clone()
                .unwrap_or_else(|| raw.hash.clone()),
            index: log.log_index,
            data: log.data.clone(),
        })
        .collect();

    Transaction {
        tx_hash: raw.hash.clone(),
        block_number: block.number,
        from,
        to: raw.to.clone(),
        nonce: raw.nonce,
        value: raw.value,
        data: raw.input.clone(),
        logs,
    }
}
