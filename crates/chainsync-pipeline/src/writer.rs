//! Database writer: persists finalized blocks from the block topic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use chainsync_core::broker::{log_errors, MessageBroker, MessageHandler};
use chainsync_core::config::WriterConfig;
use chainsync_core::error::{HandleError, SyncError};
use chainsync_core::service::{Lifecycle, Service, ServiceState};
use chainsync_core::store::BlockStore;
use chainsync_core::types::Block;

use crate::worker::release;

pub struct WriteHandler {
    store: Arc<dyn BlockStore>,
    timeout: Duration,
}

impl WriteHandler {
    pub fn new(store: Arc<dyn BlockStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl MessageHandler for WriteHandler {
    async fn handle(&self, key: &str, payload: &[u8]) -> Result<(), HandleError> {
        let block = Block::decode(payload).map_err(HandleError::Terminal)?;

        match tokio::time::timeout(self.timeout, self.store.upsert_block(&block)).await {
            Ok(Ok(())) => {
                debug!(
                    block_number = %block.block_number,
                    is_stable = block.is_stable,
                    transactions = block.transactions.len(),
                    message_key = key,
                    "block persisted"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(HandleError::Retryable(e)),
            Err(_) => Err(HandleError::Retryable(SyncError::timeout(self.timeout))),
        }
    }
}

/// The writer process: subscribes [`WriteHandler`] to the block topic.
pub struct DatabaseWriter {
    handler: Arc<WriteHandler>,
    broker: Arc<dyn MessageBroker>,
    topic: String,
    pool_size: usize,
    owns_handles: bool,
    lifecycle: Lifecycle,
}

impl DatabaseWriter {
    pub fn new(
        config: &WriterConfig,
        store: Arc<dyn BlockStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            handler: Arc::new(WriteHandler::new(store, config.timeout())),
            broker,
            topic: config.topic.clone(),
            pool_size: config.pool_size,
            owns_handles: true,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Leave the store and broker open on stop.
    pub fn sharing_handles(mut self) -> Self {
        self.owns_handles = false;
        self
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }
}

#[async_trait]
impl Service for DatabaseWriter {
    fn name(&self) -> &'static str {
        "writer"
    }

    async fn start(&self) -> Result<(), SyncError> {
        self.lifecycle.begin(self.name())?;
        self.lifecycle.set_state(ServiceState::Consuming);
        info!(topic = %self.topic, workers = self.pool_size, "database writer started");
        let result = self
            .broker
            .subscribe(
                self.lifecycle.token(),
                self.pool_size,
                &self.topic,
                self.handler.clone(),
                vec![log_errors("writer")],
            )
            .await;
        self.lifecycle.finish();
        info!("database writer stopped");
        result
    }

    async fn stop(&self) -> Result<(), SyncError> {
        if !self.lifecycle.shutdown().await {
            return Ok(());
        }
        if !self.owns_handles {
            return Ok(());
        }
        release(None, self.handler.store.as_ref(), self.broker.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::number::BlockNumber;
    use chainsync_core::types::CurrentBlockNumber;
    use chainsync_core::types::Transaction;
    use std::sync::Mutex;

    /// Records upserts; fails the first `failures` calls.
    #[derive(Default)]
    struct FlakyStore {
        failures: Mutex<usize>,
        written: Mutex<Vec<Block>>,
    }

    #[async_trait]
    impl BlockStore for FlakyStore {
        async fn current_block_number(&self) -> Result<CurrentBlockNumber, SyncError> {
            Ok(CurrentBlockNumber::new(BlockNumber::ZERO, BlockNumber::ZERO))
        }
        async fn update_current_block_number(
            &self,
            _: BlockNumber,
            _: BlockNumber,
        ) -> Result<(), SyncError> {
            Ok(())
        }
        async fn get_block(&self, _: BlockNumber) -> Result<Option<Block>, SyncError> {
            Ok(None)
        }
        async fn list_blocks(&self, _: usize) -> Result<Vec<Block>, SyncError> {
            Ok(vec![])
        }
        async fn upsert_block(&self, block: &Block) -> Result<(), SyncError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::Storage("deadlock detected".into()));
            }
            self.written.lock().unwrap().push(block.clone());
            Ok(())
        }
        async fn upsert_block_header(&self, _: &Block) -> Result<(), SyncError> {
            Ok(())
        }
        async fn get_transaction(&self, _: &str) -> Result<Option<Transaction>, SyncError> {
            Ok(None)
        }
        async fn migrate_up(&self) -> Result<(), SyncError> {
            Ok(())
        }
        async fn migrate_down(&self) -> Result<(), SyncError> {
            Ok(())
        }
        async fn migrate_to(&self, _: &str) -> Result<(), SyncError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn block() -> Block {
        Block {
            block_number: BlockNumber::from(9),
            block_hash: "0xb9".into(),
            block_time: 1,
            parent_hash: "0xb8".into(),
            is_stable: true,
            transactions: vec![],
        }
    }

    #[tokio::test]
    async fn garbage_is_terminal() {
        let handler = WriteHandler::new(Arc::new(FlakyStore::default()), Duration::from_secs(1));
        let err = handler.handle("k", b"{not json").await.unwrap_err();
        assert!(err.should_ack());
        assert!(err.error().is_decode());
    }

    #[tokio::test]
    async fn storage_failure_is_retryable() {
        let store = Arc::new(FlakyStore::default());
        *store.failures.lock().unwrap() = 1;
        let handler = WriteHandler::new(store.clone(), Duration::from_secs(1));
        let payload = block().encode().unwrap();

        let err = handler.handle("k", &payload).await.unwrap_err();
        assert!(!err.should_ack());
        handler.handle("k", &payload).await.unwrap();
        assert_eq!(store.written.lock().unwrap().as_slice(), &[block()]);
    }
}
