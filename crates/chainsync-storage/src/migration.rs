//! Versioned schema migrations and the planner shared by every backend.
//!
//! Versions are timestamps (`YYYYMMDDHHMM`) and apply in ascending order.
//! Each backend records applied versions and asks [`plan_up`], [`plan_down`]
//! or [`plan_to`] which steps to run.

use chainsync_core::error::SyncError;

/// One schema change and its rollback.
#[derive(Debug)]
pub struct Migration {
    pub version: &'static str,
    pub description: &'static str,
    /// Postgres statements, run in order inside one transaction.
    pub up: &'static [&'static str],
    pub down: &'static [&'static str],
}

/// The version creating the block, transaction, log and cursor tables.
pub const INITIAL_SCHEMA: &str = "202105221650";

pub static MIGRATIONS: &[Migration] = &[Migration {
    version: INITIAL_SCHEMA,
    description: "blocks, transactions, transaction logs and the scheduler cursor",
    up: &[
        "CREATE TABLE IF NOT EXISTS blocks (
            block_num    NUMERIC(78,0) PRIMARY KEY,
            block_hash   VARCHAR(128)  NOT NULL,
            block_time   BIGINT        NOT NULL,
            parent_hash  VARCHAR(128)  NOT NULL,
            is_stable    BOOLEAN       NOT NULL DEFAULT FALSE,
            created_at   TIMESTAMPTZ   NOT NULL DEFAULT NOW(),
            updated_at   TIMESTAMPTZ   NOT NULL DEFAULT NOW(),
            CONSTRAINT uq_blocks_hash_parent UNIQUE (block_hash, parent_hash)
        )",
        "CREATE TABLE IF NOT EXISTS transactions (
            tx_hash      VARCHAR(128)  PRIMARY KEY,
            block_num    NUMERIC(78,0) NOT NULL REFERENCES blocks (block_num) ON DELETE CASCADE,
            position     INTEGER       NOT NULL,
            from_address VARCHAR(128)  NOT NULL,
            to_address   VARCHAR(128),
            nonce        NUMERIC(20,0) NOT NULL,
            value        NUMERIC(78,0) NOT NULL,
            data         BYTEA         NOT NULL,
            created_at   TIMESTAMPTZ   NOT NULL DEFAULT NOW(),
            updated_at   TIMESTAMPTZ   NOT NULL DEFAULT NOW()
        )",
        "CREATE INDEX IF NOT EXISTS idx_transactions_block_num ON transactions (block_num)",
        "CREATE TABLE IF NOT EXISTS transaction_logs (
            id           BIGSERIAL     PRIMARY KEY,
            tx_hash      VARCHAR(128)  NOT NULL REFERENCES transactions (tx_hash) ON DELETE CASCADE,
            log_index    BIGINT        NOT NULL,
            data         BYTEA         NOT NULL,
            created_at   TIMESTAMPTZ   NOT NULL DEFAULT NOW(),
            updated_at   TIMESTAMPTZ   NOT NULL DEFAULT NOW(),
            CONSTRAINT uq_transaction_logs_tx_index UNIQUE (tx_hash, log_index)
        )",
        "CREATE TABLE IF NOT EXISTS current_block_number (
            id               BIGINT        PRIMARY KEY,
            block_num        NUMERIC(78,0) NOT NULL,
            online_block_num NUMERIC(78,0) NOT NULL
        )",
        "INSERT INTO current_block_number (id, block_num, online_block_num)
         VALUES (1, 0, 0)
         ON CONFLICT (id) DO NOTHING",
    ],
    down: &[
        "DROP TABLE IF EXISTS transaction_logs",
        "DROP TABLE IF EXISTS transactions",
        "DROP TABLE IF EXISTS blocks",
        "DROP TABLE IF EXISTS current_block_number",
    ],
}];

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Apply(&'static Migration),
    Revert(&'static Migration),
}

impl Step {
    pub fn version(&self) -> &'static str {
        match self {
            Step::Apply(m) | Step::Revert(m) => m.version,
        }
    }
}

fn is_applied(applied: &[String], version: &str) -> bool {
    applied.iter().any(|v| v == version)
}

/// Every pending migration, oldest first.
pub fn plan_up(applied: &[String]) -> Vec<Step> {
    MIGRATIONS
        .iter()
        .filter(|m| !is_applied(applied, m.version))
        .map(Step::Apply)
        .collect()
}

/// Every applied migration, newest first.
pub fn plan_down(applied: &[String]) -> Vec<Step> {
    MIGRATIONS
        .iter()
        .rev()
        .filter(|m| is_applied(applied, m.version))
        .map(Step::Revert)
        .collect()
}

/// Steps leaving `version` as the newest applied migration: newer ones are
/// reverted, it and older pending ones are applied.
pub fn plan_to(applied: &[String], version: &str) -> Result<Vec<Step>, SyncError> {
    let target = MIGRATIONS
        .iter()
        .position(|m| m.version == version)
        .ok_or_else(|| SyncError::Config(format!("unknown migration version {version}")))?;

    let mut steps: Vec<Step> = MIGRATIONS[target + 1..]
        .iter()
        .rev()
        .filter(|m| is_applied(applied, m.version))
        .map(Step::Revert)
        .collect();
    steps.extend(
        MIGRATIONS[..=target]
            .iter()
            .filter(|m| !is_applied(applied, m.version))
            .map(Step::Apply),
    );
    Ok(steps)
}
