//! In-memory storage backend.
//!
//! Mirrors the relational schema in RAM: the same uniqueness rules, the same
//! migration gate, the same upsert semantics. Useful for tests and single
//! process development setups. All data is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use chainsync_core::error::SyncError;
use chainsync_core::number::BlockNumber;
use chainsync_core::store::BlockStore;
use chainsync_core::types::{Block, CurrentBlockNumber, Transaction, TransactionLog};

use crate::migration::{self, Step, INITIAL_SCHEMA};

struct BlockRow {
    /// Header only; `transactions` is always empty.
    header: Block,
    /// Hashes of the block's transactions in block order.
    tx_hashes: Vec<String>,
}

struct Tables {
    blocks: BTreeMap<BlockNumber, BlockRow>,
    /// Transactions without their logs.
    transactions: HashMap<String, Transaction>,
    logs: BTreeMap<(String, u64), TransactionLog>,
    cursor: CurrentBlockNumber,
    next_log_id: i64,
}

impl Tables {
    fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            transactions: HashMap::new(),
            logs: BTreeMap::new(),
            cursor: CurrentBlockNumber::new(BlockNumber::ZERO, BlockNumber::ZERO),
            next_log_id: 1,
        }
    }

    fn check_header_unique(&self, block: &Block) -> Result<(), SyncError> {
        let clash = self.blocks.iter().any(|(number, row)| {
            *number != block.block_number
                && row.header.block_hash == block.block_hash
                && row.header.parent_hash == block.parent_hash
        });
        if clash {
            return Err(SyncError::Storage(format!(
                "duplicate (block_hash, parent_hash) = ({}, {})",
                block.block_hash, block.parent_hash
            )));
        }
        Ok(())
    }

    fn put_header(&mut self, block: &Block) {
        let header = Block {
            is_stable: block.is_stable,
            ..block.provisional()
        };
        self.blocks
            .entry(block.block_number)
            .and_modify(|row| row.header = header.clone())
            .or_insert_with(|| BlockRow {
                header,
                tx_hashes: Vec::new(),
            });
    }

    fn drop_transaction(&mut self, tx_hash: &str) {
        self.transactions.remove(tx_hash);
        self.logs.retain(|(hash, _), _| hash != tx_hash);
    }

    fn put_transaction(&mut self, tx: &Transaction) {
        // a transaction re-mined in another block moves there
        if let Some(previous) = self.transactions.get(&tx.tx_hash) {
            if previous.block_number != tx.block_number {
                if let Some(row) = self.blocks.get_mut(&previous.block_number) {
                    row.tx_hashes.retain(|h| h != &tx.tx_hash);
                }
            }
        }
        self.transactions.insert(
            tx.tx_hash.clone(),
            Transaction {
                logs: Vec::new(),
                ..tx.clone()
            },
        );

        let keep: Vec<u64> = tx.logs.iter().map(|l| l.index).collect();
        self.logs
            .retain(|(hash, index), _| hash != &tx.tx_hash || keep.contains(index));
        for log in &tx.logs {
            let key = (tx.tx_hash.clone(), log.index);
            let id = match self.logs.get(&key).and_then(|existing| existing.id) {
                Some(id) => id,
                None => {
                    let id = self.next_log_id;
                    self.next_log_id += 1;
                    id
                }
            };
            self.logs.insert(
                key,
                TransactionLog {
                    id: Some(id),
                    tx_hash: tx.tx_hash.clone(),
                    index: log.index,
                    data: log.data.clone(),
                },
            );
        }
    }

    fn load_transaction(&self, tx_hash: &str) -> Option<Transaction> {
        let tx = self.transactions.get(tx_hash)?;
        let logs = self
            .logs
            .range((tx_hash.to_string(), 0)..=(tx_hash.to_string(), u64::MAX))
            .map(|(_, log)| log.clone())
            .collect();
        Some(Transaction {
            logs,
            ..tx.clone()
        })
    }
}

#[derive(Default)]
struct State {
    applied: Vec<String>,
    tables: Option<Tables>,
    closed: bool,
}

/// In-memory [`BlockStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// An empty store. Tables appear once [`BlockStore::migrate_up`] runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with every migration already applied.
    pub fn with_schema() -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for step in migration::plan_up(&[]) {
                apply(&mut state, step);
            }
        }
        store
    }

    /// Versions applied so far, oldest first.
    pub fn applied_versions(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.lock().tables.as_ref().map_or(0, |t| t.blocks.len())
    }

    /// Number of stored transaction logs.
    pub fn log_count(&self) -> usize {
        self.lock().tables.as_ref().map_or(0, |t| t.logs.len())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_tables<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SyncError::Closed("store"));
        }
        match state.tables.as_mut() {
            Some(tables) => f(tables),
            None => Err(SyncError::NotFound(
                "schema missing, run migrations first".into(),
            )),
        }
    }

    fn run(&self, steps: Vec<Step>) -> Result<(), SyncError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SyncError::Closed("store"));
        }
        for step in steps {
            apply(&mut state, step);
        }
        Ok(())
    }
}

fn apply(state: &mut State, step: Step) {
    match step {
        Step::Apply(m) => {
            if m.version == INITIAL_SCHEMA {
                state.tables = Some(Tables::new());
            }
            state.applied.push(m.version.to_string());
            info!(version = m.version, "migration applied");
        }
        Step::Revert(m) => {
            if m.version == INITIAL_SCHEMA {
                state.tables = None;
            }
            state.applied.retain(|v| v != m.version);
            info!(version = m.version, "migration rolled back");
        }
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn current_block_number(&self) -> Result<CurrentBlockNumber, SyncError> {
        self.with_tables(|t| Ok(t.cursor))
    }

    async fn update_current_block_number(
        &self,
        block_number: BlockNumber,
        online_block_number: BlockNumber,
    ) -> Result<(), SyncError> {
        self.with_tables(|t| {
            t.cursor = CurrentBlockNumber::new(block_number, online_block_number);
            Ok(())
        })
    }

    async fn get_block(&self, block_number: BlockNumber) -> Result<Option<Block>, SyncError> {
        self.with_tables(|t| {
            let Some(row) = t.blocks.get(&block_number) else {
                return Ok(None);
            };
            let transactions = row
                .tx_hashes
                .iter()
                .filter_map(|h| t.load_transaction(h))
                .collect();
            Ok(Some(Block {
                transactions,
                ..row.header.clone()
            }))
        })
    }

    async fn list_blocks(&self, limit: usize) -> Result<Vec<Block>, SyncError> {
        self.with_tables(|t| {
            Ok(t.blocks
                .values()
                .rev()
                .take(limit)
                .map(|row| row.header.clone())
                .collect())
        })
    }

    async fn upsert_block(&self, block: &Block) -> Result<(), SyncError> {
        self.with_tables(|t| {
            t.check_header_unique(block)?;

            let incoming: Vec<&str> = block.transactions.iter().map(|tx| tx.tx_hash.as_str()).collect();
            let stale: Vec<String> = t
                .blocks
                .get(&block.block_number)
                .map(|row| {
                    row.tx_hashes
                        .iter()
                        .filter(|h| !incoming.contains(&h.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for hash in &stale {
                t.drop_transaction(hash);
            }

            t.put_header(block);
            for tx in &block.transactions {
                t.put_transaction(tx);
            }
            if let Some(row) = t.blocks.get_mut(&block.block_number) {
                row.tx_hashes = incoming.iter().map(|h| h.to_string()).collect();
            }
            debug!(
                block_number = %block.block_number,
                transactions = block.transactions.len(),
                removed = stale.len(),
                "block upserted"
            );
            Ok(())
        })
    }

    async fn upsert_block_header(&self, block: &Block) -> Result<(), SyncError> {
        self.with_tables(|t| {
            t.check_header_unique(block)?;
            t.put_header(block);
            Ok(())
        })
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<Transaction>, SyncError> {
        self.with_tables(|t| Ok(t.load_transaction(tx_hash)))
    }

    async fn migrate_up(&self) -> Result<(), SyncError> {
        let steps = migration::plan_up(&self.lock().applied);
        self.run(steps)
    }

    async fn migrate_down(&self) -> Result<(), SyncError> {
        let steps = migration::plan_down(&self.lock().applied);
        self.run(steps)
    }

    async fn migrate_to(&self, version: &str) -> Result<(), SyncError> {
        let steps = migration::plan_to(&self.lock().applied, version)?;
        self.run(steps)
    }

    async fn close(&self) -> Result<(), SyncError> {
        self.lock().closed = true;
        Ok(())
    }
}
