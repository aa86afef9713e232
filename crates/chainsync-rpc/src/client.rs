//! EVM chain client over the pooled JSON-RPC transport.

use std::str::FromStr;

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use chainsync_core::chain::{quantity, ChainBlock, ChainClient, ChainReceipt, ChainTransaction};
use chainsync_core::config::RpcConfig;
use chainsync_core::error::SyncError;
use chainsync_core::number::BlockNumber;

use crate::error::TransportError;
use crate::http::HttpDialer;
use crate::pool::{ConnectionPool, Dial};
use crate::retry::RetryPolicy;
use crate::signer::recover_signer;
use crate::transport::RpcTransport;

/// [`ChainClient`] implementation for Ethereum-compatible nodes.
///
/// The client is bound to one chain id, learned from configuration or from
/// `eth_chainId` at connect time. Senders are recovered from transaction
/// signatures made for that chain.
pub struct EvmChainClient<D: Dial> {
    pool: ConnectionPool<D>,
    chain_id: u64,
}

impl EvmChainClient<HttpDialer> {
    /// Pooled HTTP client for `config.url`.
    pub async fn from_config(config: &RpcConfig) -> Result<Self, SyncError> {
        if config.url.is_empty() {
            return Err(SyncError::Config("rpc.url must be set".into()));
        }
        let dialer = HttpDialer {
            url: config.url.clone(),
            request_timeout: config.request_timeout(),
            retry: RetryPolicy::from_config(config),
        };
        let pool = ConnectionPool::new(dialer, config.pool_size, config.dial_timeout());
        Self::connect(pool, config.chain_id).await
    }
}

impl<D> EvmChainClient<D>
where
    D: Dial,
    D::Conn: RpcTransport,
{
    /// Bind a client to `pool`. Without a configured chain id the node is asked once.
    pub async fn connect(pool: ConnectionPool<D>, chain_id: Option<u64>) -> Result<Self, SyncError> {
        let chain_id = match chain_id {
            Some(id) => id,
            None => {
                let conn = pool.get().await?;
                let raw: String = conn.call("eth_chainId", vec![]).await?;
                quantity::parse(&raw).map_err(SyncError::Rpc)?
            }
        };
        info!(chain_id, slots = pool.capacity(), "chain client ready");
        Ok(Self { pool, chain_id })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn pool(&self) -> &ConnectionPool<D> {
        &self.pool
    }

    /// One call on the next pooled connection. Connection failures evict the slot.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let conn = self.pool.get().await?;
        let result = conn.call(method, params).await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                debug!(slot = conn.slot(), method, error = %e, "evicting pooled connection");
                self.pool.invalidate(conn.slot()).await;
            }
        }
        result
    }
}

#[async_trait]
impl<D> ChainClient for EvmChainClient<D>
where
    D: Dial,
    D::Conn: RpcTransport,
{
    async fn current_height(&self) -> Result<BlockNumber, SyncError> {
        Ok(self.call::<BlockNumber>("eth_blockNumber", vec![]).await?)
    }

    async fn block_by_number(&self, number: BlockNumber) -> Result<ChainBlock, SyncError> {
        let target = number.to_hex();
        let block: Option<ChainBlock> = self
            .call("eth_getBlockByNumber", vec![json!(target), json!(true)])
            .await?;
        block.ok_or_else(|| {
            TransportError::Missing {
                method: "eth_getBlockByNumber".into(),
                target,
            }
            .into()
        })
    }

    async fn receipt(&self, tx_hash: &str) -> Result<ChainReceipt, SyncError> {
        let receipt: Option<ChainReceipt> = self
            .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        receipt.ok_or_else(|| {
            TransportError::Missing {
                method: "eth_getTransactionReceipt".into(),
                target: tx_hash.to_string(),
            }
            .into()
        })
    }

    fn recover_sender(&self, tx: &ChainTransaction) -> Result<String, SyncError> {
        let fail = |reason: String| SyncError::Recovery {
            tx_hash: tx.hash.clone(),
            reason,
        };
        let signer = recover_signer(tx, self.chain_id).map_err(|e| fail(e.to_string()))?;
        if let Some(claimed) = tx.from.as_deref() {
            let claimed = Address::from_str(claimed).map_err(|e| fail(format!("{claimed}: {e}")))?;
            if claimed != signer {
                return Err(fail(format!(
                    "node reported sender {}, signature recovers {}",
                    claimed.to_checksum(None),
                    signer.to_checksum(None)
                )));
            }
        }
        Ok(signer.to_checksum(None))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
