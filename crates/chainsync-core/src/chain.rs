//! Upstream chain capability and the raw shapes it returns.
//!
//! The raw types deserialize directly from EVM JSON-RPC responses
//! (`eth_getBlockByNumber` with full transactions, `eth_getTransactionReceipt`),
//! where every quantity is a `0x`-prefixed hex string.

use alloy_eips::eip2930::AccessList;
use alloy_eips::eip7702::SignedAuthorization;
use alloy_primitives::{Bytes, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SyncError;
use crate::number::BlockNumber;

/// A block as reported by the node, transactions included.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBlock {
    pub number: BlockNumber,
    pub hash: String,
    pub parent_hash: String,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(default)]
    pub transactions: Vec<ChainTransaction>,
}

/// A signed transaction as reported by the node.
///
/// Carries every field that goes into the signing payload so the sender can
/// be recovered from `v`/`r`/`s` instead of taken from `from`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    pub hash: String,
    /// EIP-2718 type. Absent on nodes that predate typed transactions.
    #[serde(default, rename = "type", with = "quantity::option")]
    pub tx_type: Option<u64>,
    /// Sender claimed by the node. Checked against the signature by
    /// [`ChainClient::recover_sender`].
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(with = "quantity")]
    pub nonce: u64,
    pub value: BlockNumber,
    #[serde(default)]
    pub input: Bytes,
    /// Absent on pre-EIP-155 transactions.
    #[serde(default, with = "quantity::option")]
    pub chain_id: Option<u64>,
    #[serde(default, with = "quantity::option")]
    pub gas: Option<u64>,
    #[serde(default, with = "quantity::wide")]
    pub gas_price: Option<u128>,
    #[serde(default, with = "quantity::wide")]
    pub max_fee_per_gas: Option<u128>,
    #[serde(default, with = "quantity::wide")]
    pub max_priority_fee_per_gas: Option<u128>,
    #[serde(default, with = "quantity::wide")]
    pub max_fee_per_blob_gas: Option<u128>,
    #[serde(default)]
    pub access_list: Option<AccessList>,
    #[serde(default)]
    pub blob_versioned_hashes: Option<Vec<B256>>,
    #[serde(default)]
    pub authorization_list: Option<Vec<SignedAuthorization>>,
    #[serde(default, with = "quantity::option")]
    pub v: Option<u64>,
    #[serde(default)]
    pub r: Option<U256>,
    #[serde(default)]
    pub s: Option<U256>,
    #[serde(default, with = "quantity::option")]
    pub y_parity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReceipt {
    pub transaction_hash: String,
    #[serde(default)]
    pub logs: Vec<ChainLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLog {
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(with = "quantity")]
    pub log_index: u64,
    #[serde(default)]
    pub data: Bytes,
}

/// Read access to an upstream chain node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain head.
    async fn current_height(&self) -> Result<BlockNumber, SyncError>;

    /// Full block by number. `SyncError::NotFound` when the node does not have it yet.
    async fn block_by_number(&self, number: BlockNumber) -> Result<ChainBlock, SyncError>;

    async fn receipt(&self, tx_hash: &str) -> Result<ChainReceipt, SyncError>;

    /// Sender recovered from the transaction signature. Fails when the
    /// signature does not verify, was made for another chain, or disagrees
    /// with the sender the node reported.
    fn recover_sender(&self, tx: &ChainTransaction) -> Result<String, SyncError>;

    /// Releases upstream connections. Safe to call more than once.
    async fn close(&self);
}

/// Serde helpers for `0x`-prefixed hex `u64` quantities.
pub mod quantity {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn parse(s: &str) -> Result<u64, String> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("quantity without 0x prefix: {s}"))?;
        u64::from_str_radix(digits, 16).map_err(|e| format!("invalid quantity {s}: {e}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    /// `Option<u128>`, for fee fields that overflow `u64` on some chains.
    pub mod wide {
        use super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u128>, D::Error> {
            let Some(s) = Option::<String>::deserialize(deserializer)? else {
                return Ok(None);
            };
            let digits = s
                .strip_prefix("0x")
                .ok_or_else(|| D::Error::custom(format!("quantity without 0x prefix: {s}")))?;
            u128::from_str_radix(digits, 16)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid quantity {s}: {e}")))
        }
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => parse(&s).map(Some).map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }
}
