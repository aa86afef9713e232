//! Crawler worker: resolves crawl requests into full blocks.
//!
//! For every request the worker fetches the block and each transaction's
//! receipt, writes a provisional header so the block is visible early, and
//! publishes the assembled block to the writer topic under the request's key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use chainsync_core::broker::{log_errors, MessageBroker, MessageHandler};
use chainsync_core::chain::ChainClient;
use chainsync_core::config::{CrawlerConfig, WriterConfig};
use chainsync_core::error::{HandleError, SyncError};
use chainsync_core::service::{Lifecycle, Service, ServiceState};
use chainsync_core::store::BlockStore;
use chainsync_core::types::{Block, CrawlRequest};

use crate::transform;
use crate::worker::release;

/// Handles one crawl request.
pub struct CrawlHandler {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn BlockStore>,
    broker: Arc<dyn MessageBroker>,
    block_topic: String,
    timeout: Duration,
    legacy_payload: bool,
}

impl CrawlHandler {
    pub fn new(
        crawler: &CrawlerConfig,
        block_topic: impl Into<String>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn BlockStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            chain,
            store,
            broker,
            block_topic: block_topic.into(),
            timeout: crawler.timeout(),
            legacy_payload: crawler.legacy_payload,
        }
    }

    /// Fetch and assemble the block for `request`.
    pub async fn crawl(&self, request: CrawlRequest) -> Result<Block, SyncError> {
        let raw = self.chain.block_by_number(request.block_number).await?;
        let mut block = transform::block_header(&raw, request.is_stable);

        for tx in &raw.transactions {
            let receipt = self.chain.receipt(&tx.hash).await?;
            let from = match self.chain.recover_sender(tx) {
                Ok(from) => from,
                Err(e) => {
                    warn!(
                        block_number = %request.block_number,
                        tx_hash = %tx.hash,
                        error = %e,
                        "skipping transaction"
                    );
                    continue;
                }
            };
            block
                .transactions
                .push(transform::transaction(tx, &raw, from, &receipt));
        }
        Ok(block)
    }

    async fn process(&self, key: &str, request: CrawlRequest) -> Result<(), HandleError> {
        let block = self.crawl(request).await.map_err(HandleError::Retryable)?;

        if let Err(e) = self.store.upsert_block_header(&block.provisional()).await {
            warn!(block_number = %block.block_number, error = %e, "provisional write failed");
        }

        let payload = block.encode().map_err(HandleError::Terminal)?;
        self.broker
            .publish(&self.block_topic, key, &payload)
            .await
            .map_err(HandleError::Retryable)?;

        debug!(
            block_number = %block.block_number,
            transactions = block.transactions.len(),
            logs = block.log_count(),
            message_key = key,
            "block handed to writer"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for CrawlHandler {
    async fn handle(&self, key: &str, payload: &[u8]) -> Result<(), HandleError> {
        let request = CrawlRequest::decode_with(payload, self.legacy_payload)
            .map_err(HandleError::Terminal)?;
        debug!(block_number = %request.block_number, is_stable = request.is_stable, message_key = key, "crawl");

        match tokio::time::timeout(self.timeout, self.process(key, request)).await {
            Ok(result) => result,
            Err(_) => Err(HandleError::Retryable(SyncError::timeout(self.timeout))),
        }
    }
}

/// The crawler process: subscribes [`CrawlHandler`] to the request topic.
pub struct Crawler {
    handler: Arc<CrawlHandler>,
    request_topic: String,
    pool_size: usize,
    owns_handles: bool,
    lifecycle: Lifecycle,
}

impl Crawler {
    pub fn new(
        crawler: &CrawlerConfig,
        writer: &WriterConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn BlockStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            handler: Arc::new(CrawlHandler::new(
                crawler,
                writer.topic.clone(),
                chain,
                store,
                broker,
            )),
            request_topic: crawler.topic.clone(),
            pool_size: crawler.pool_size,
            owns_handles: true,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Leave the chain client, store and broker open on stop.
    pub fn sharing_handles(mut self) -> Self {
        self.owns_handles = false;
        self
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }
}

#[async_trait]
impl Service for Crawler {
    fn name(&self) -> &'static str {
        "crawler"
    }

    async fn start(&self) -> Result<(), SyncError> {
        self.lifecycle.begin(self.name())?;
        self.lifecycle.set_state(ServiceState::Consuming);
        info!(topic = %self.request_topic, workers = self.pool_size, "crawler started");
        let result = self
            .handler
            .broker
            .subscribe(
                self.lifecycle.token(),
                self.pool_size,
                &self.request_topic,
                self.handler.clone(),
                vec![log_errors("crawler")],
            )
            .await;
        self.lifecycle.finish();
        info!("crawler stopped");
        result
    }

    async fn stop(&self) -> Result<(), SyncError> {
        if !self.lifecycle.shutdown().await {
            return Ok(());
        }
        if !self.owns_handles {
            return Ok(());
        }
        release(
            Some(self.handler.chain.as_ref()),
            self.handler.store.as_ref(),
            self.handler.broker.as_ref(),
        )
        .await
    }
}
