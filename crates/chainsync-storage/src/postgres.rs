//! PostgreSQL storage backend.
//!
//! Persists blocks, transactions, logs and the scheduler cursor through a
//! `sqlx` connection pool.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! chainsync-storage = { version = "0.2", features = ["postgres"] }
//! ```
//!
//! # Schema
//! Tables are created by migrations (see [`crate::migration`]), never on
//! connect. Only the `chainsync_migrations` bookkeeping table is ensured at
//! startup. Block numbers and values are `NUMERIC(78,0)`, wide enough for
//! any 256-bit quantity; they are bound and read back as decimal text.

use std::str::FromStr;

use alloy_primitives::Bytes;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction as SqlTransaction};
use tracing::{debug, info};

use chainsync_core::config::DatabaseConfig;
use chainsync_core::error::SyncError;
use chainsync_core::number::BlockNumber;
use chainsync_core::store::BlockStore;
use chainsync_core::types::{Block, CurrentBlockNumber, Transaction, TransactionLog};

use crate::migration::{self, Step};

/// Postgres error code for "relation does not exist".
const UNDEFINED_TABLE: &str = "42P01";

fn storage_err(e: sqlx::Error) -> SyncError {
    match &e {
        sqlx::Error::PoolClosed => SyncError::Closed("store"),
        sqlx::Error::PoolTimedOut => SyncError::Storage("connection pool timed out".into()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
            SyncError::NotFound(format!("schema missing, run migrations first ({db})"))
        }
        _ => SyncError::Storage(e.to_string()),
    }
}

fn number(row: &PgRow, column: &str) -> Result<BlockNumber, SyncError> {
    let raw: String = row.try_get(column).map_err(storage_err)?;
    BlockNumber::from_str(&raw)
}

fn unsigned(row: &PgRow, column: &str) -> Result<u64, SyncError> {
    let raw: i64 = row.try_get(column).map_err(storage_err)?;
    u64::try_from(raw).map_err(|_| SyncError::Storage(format!("negative {column}: {raw}")))
}

fn signed(value: u64, column: &str) -> Result<i64, SyncError> {
    i64::try_from(value).map_err(|_| SyncError::Storage(format!("{column} out of range: {value}")))
}

/// PostgreSQL-backed [`BlockStore`].
///
/// Cheaply cloneable; wraps a connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect using the pool settings in `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| SyncError::Storage(format!("postgres connect: {e}")))?;

        let store = Self { pool };
        store.ensure_migration_table().await?;
        info!(
            max_connections = config.max_connections,
            "PostgresStore connected"
        );
        Ok(store)
    }

    /// Wrap an existing pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, SyncError> {
        let store = Self { pool };
        store.ensure_migration_table().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_migration_table(&self) -> Result<(), SyncError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chainsync_migrations (
                version    VARCHAR(32) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<String>, SyncError> {
        let rows = sqlx::query("SELECT version FROM chainsync_migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("version").map_err(storage_err))
            .collect()
    }

    /// Run each step in its own transaction, recording it in `chainsync_migrations`.
    async fn run(&self, steps: Vec<Step>) -> Result<(), SyncError> {
        for step in steps {
            let mut tx = self.pool.begin().await.map_err(storage_err)?;
            let (statements, bookkeeping) = match step {
                Step::Apply(m) => (m.up, "INSERT INTO chainsync_migrations (version) VALUES ($1)"),
                Step::Revert(m) => (m.down, "DELETE FROM chainsync_migrations WHERE version = $1"),
            };
            for stmt in statements {
                sqlx::query(stmt).execute(&mut *tx).await.map_err(|e| {
                    SyncError::Storage(format!("migration {} failed: {e}", step.version()))
                })?;
            }
            sqlx::query(bookkeeping)
                .bind(step.version())
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            tx.commit().await.map_err(storage_err)?;
            match step {
                Step::Apply(m) => info!(version = m.version, "migration applied"),
                Step::Revert(m) => info!(version = m.version, "migration rolled back"),
            }
        }
        Ok(())
    }

    async fn write_header(
        tx: &mut SqlTransaction<'_, Postgres>,
        block: &Block,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO blocks (block_num, block_hash, block_time, parent_hash, is_stable)
             VALUES ($1::numeric, $2, $3, $4, $5)
             ON CONFLICT (block_num) DO UPDATE SET
                block_hash  = EXCLUDED.block_hash,
                block_time  = EXCLUDED.block_time,
                parent_hash = EXCLUDED.parent_hash,
                is_stable   = EXCLUDED.is_stable,
                updated_at  = NOW()",
        )
        .bind(block.block_number.to_string())
        .bind(&block.block_hash)
        .bind(signed(block.block_time, "block_time")?)
        .bind(&block.parent_hash)
        .bind(block.is_stable)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn write_transaction(
        tx: &mut SqlTransaction<'_, Postgres>,
        position: usize,
        transaction: &Transaction,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO transactions
                (tx_hash, block_num, position, from_address, to_address, nonce, value, data)
             VALUES ($1, $2::numeric, $3, $4, $5, $6::numeric, $7::numeric, $8)
             ON CONFLICT (tx_hash) DO UPDATE SET
                block_num    = EXCLUDED.block_num,
                position     = EXCLUDED.position,
                from_address = EXCLUDED.from_address,
                to_address   = EXCLUDED.to_address,
                nonce        = EXCLUDED.nonce,
                value        = EXCLUDED.value,
                data         = EXCLUDED.data,
                updated_at   = NOW()",
        )
        .bind(&transaction.tx_hash)
        .bind(transaction.block_number.to_string())
        .bind(position as i32)
        .bind(&transaction.from)
        .bind(transaction.to.as_deref())
        .bind(transaction.nonce.to_string())
        .bind(transaction.value.to_string())
        .bind(&transaction.data[..])
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;

        let indexes = transaction
            .logs
            .iter()
            .map(|l| signed(l.index, "log_index"))
            .collect::<Result<Vec<i64>, _>>()?;
        sqlx::query("DELETE FROM transaction_logs WHERE tx_hash = $1 AND log_index <> ALL($2)")
            .bind(&transaction.tx_hash)
            .bind(&indexes)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;

        for (log, index) in transaction.logs.iter().zip(&indexes) {
            sqlx::query(
                "INSERT INTO transaction_logs (tx_hash, log_index, data)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (tx_hash, log_index) DO UPDATE SET
                    data       = EXCLUDED.data,
                    updated_at = NOW()",
            )
            .bind(&transaction.tx_hash)
            .bind(index)
            .bind(&log.data[..])
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn load_logs(&self, tx_hash: &str) -> Result<Vec<TransactionLog>, SyncError> {
        let rows = sqlx::query(
            "SELECT id, tx_hash, log_index, data FROM transaction_logs
             WHERE tx_hash = $1 ORDER BY log_index",
        )
        .bind(tx_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| {
                Ok(TransactionLog {
                    id: Some(r.try_get("id").map_err(storage_err)?),
                    tx_hash: r.try_get("tx_hash").map_err(storage_err)?,
                    index: unsigned(r, "log_index")?,
                    data: Bytes::from(r.try_get::<Vec<u8>, _>("data").map_err(storage_err)?),
                })
            })
            .collect()
    }

    async fn load_transaction(&self, row: &PgRow) -> Result<Transaction, SyncError> {
        let tx_hash: String = row.try_get("tx_hash").map_err(storage_err)?;
        let logs = self.load_logs(&tx_hash).await?;
        let nonce: String = row.try_get("nonce").map_err(storage_err)?;
        Ok(Transaction {
            block_number: number(row, "block_num")?,
            from: row.try_get("from_address").map_err(storage_err)?,
            to: row.try_get("to_address").map_err(storage_err)?,
            nonce: nonce
                .parse()
                .map_err(|e| SyncError::Storage(format!("nonce {nonce}: {e}")))?,
            value: number(row, "value")?,
            data: Bytes::from(row.try_get::<Vec<u8>, _>("data").map_err(storage_err)?),
            logs,
            tx_hash,
        })
    }
}

const TRANSACTION_COLUMNS: &str = "tx_hash, block_num::text AS block_num, from_address, \
     to_address, nonce::text AS nonce, value::text AS value, data";

const BLOCK_COLUMNS: &str =
    "block_num::text AS block_num, block_hash, block_time, parent_hash, is_stable";

fn header(row: &PgRow) -> Result<Block, SyncError> {
    Ok(Block {
        block_number: number(row, "block_num")?,
        block_hash: row.try_get("block_hash").map_err(storage_err)?,
        block_time: unsigned(row, "block_time")?,
        parent_hash: row.try_get("parent_hash").map_err(storage_err)?,
        is_stable: row.try_get("is_stable").map_err(storage_err)?,
        transactions: Vec::new(),
    })
}

#[async_trait]
impl BlockStore for PostgresStore {
    async fn current_block_number(&self) -> Result<CurrentBlockNumber, SyncError> {
        let row = sqlx::query(
            "SELECT id, block_num::text AS block_num, online_block_num::text AS online_block_num
             FROM current_block_number WHERE id = $1",
        )
        .bind(CurrentBlockNumber::ROW_ID)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?
        .ok_or_else(|| SyncError::NotFound("current block number row".into()))?;

        Ok(CurrentBlockNumber {
            id: row.try_get("id").map_err(storage_err)?,
            block_number: number(&row, "block_num")?,
            online_block_number: number(&row, "online_block_num")?,
        })
    }

    async fn update_current_block_number(
        &self,
        block_number: BlockNumber,
        online_block_number: BlockNumber,
    ) -> Result<(), SyncError> {
        let result = sqlx::query(
            "UPDATE current_block_number
             SET block_num = $1::numeric, online_block_num = $2::numeric
             WHERE id = $3",
        )
        .bind(block_number.to_string())
        .bind(online_block_number.to_string())
        .bind(CurrentBlockNumber::ROW_ID)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound("current block number row".into()));
        }
        debug!(%block_number, %online_block_number, "cursor updated");
        Ok(())
    }

    async fn get_block(&self, block_number: BlockNumber) -> Result<Option<Block>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_num = $1::numeric"
        ))
        .bind(block_number.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut block = header(&row)?;

        let tx_rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE block_num = $1::numeric ORDER BY position"
        ))
        .bind(block_number.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        for tx_row in &tx_rows {
            block.transactions.push(self.load_transaction(tx_row).await?);
        }
        Ok(Some(block))
    }

    async fn list_blocks(&self, limit: usize) -> Result<Vec<Block>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY blocks.block_num DESC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(header).collect()
    }

    async fn upsert_block(&self, block: &Block) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        Self::write_header(&mut tx, block).await?;

        let hashes: Vec<String> = block.transactions.iter().map(|t| t.tx_hash.clone()).collect();
        let removed = sqlx::query(
            "DELETE FROM transactions WHERE block_num = $1::numeric AND tx_hash <> ALL($2)",
        )
        .bind(block.block_number.to_string())
        .bind(&hashes)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();

        for (position, transaction) in block.transactions.iter().enumerate() {
            Self::write_transaction(&mut tx, position, transaction).await?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(
            block_number = %block.block_number,
            transactions = block.transactions.len(),
            removed,
            "block upserted"
        );
        Ok(())
    }

    async fn upsert_block_header(&self, block: &Block) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        Self::write_header(&mut tx, block).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<Transaction>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE tx_hash = $1"
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        match row {
            Some(row) => Ok(Some(self.load_transaction(&row).await?)),
            None => Ok(None),
        }
    }

    async fn migrate_up(&self) -> Result<(), SyncError> {
        let applied = self.applied_versions().await?;
        self.run(migration::plan_up(&applied)).await
    }

    async fn migrate_down(&self) -> Result<(), SyncError> {
        let applied = self.applied_versions().await?;
        self.run(migration::plan_down(&applied)).await
    }

    async fn migrate_to(&self, version: &str) -> Result<(), SyncError> {
        let applied = self.applied_versions().await?;
        self.run(migration::plan_to(&applied, version)?).await
    }

    async fn close(&self) -> Result<(), SyncError> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("PostgresStore closed");
        }
        Ok(())
    }
}
