//! Reorg reconciliation triggered from the read path.
//!
//! A block is written as unstable first. Once the scheduler cursor has moved
//! more than `unstable_number` blocks past it, the block can no longer be
//! reorganized away, so the next read of it enqueues a stable re-crawl.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::broker::{random_key, MessageBroker};
use crate::number::BlockNumber;
use crate::store::BlockStore;
use crate::types::{Block, CrawlRequest};

/// Returns `true` if `block_number` is below `cursor - unstable_number`.
/// Never triggers while the cursor is still inside the first unstable window.
pub fn needs_recrawl(block_number: BlockNumber, cursor: BlockNumber, unstable_number: u64) -> bool {
    match cursor.checked_sub(unstable_number) {
        Some(threshold) => block_number < threshold,
        None => false,
    }
}

/// Re-enqueues unstable blocks that have left the unstable window.
#[derive(Clone)]
pub struct Reconciler {
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn BlockStore>,
    request_topic: String,
    unstable_number: u64,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn BlockStore>,
        request_topic: impl Into<String>,
        unstable_number: u64,
    ) -> Self {
        Self {
            broker,
            store,
            request_topic: request_topic.into(),
            unstable_number,
        }
    }

    /// Checks `block` against the persisted cursor and, if it is due, publishes
    /// a stable crawl request for it. Failures are logged, never returned.
    /// Returns `true` when a request was published.
    pub async fn compensate(&self, block: &Block) -> bool {
        if block.is_stable {
            return false;
        }
        let cursor = match self.store.current_block_number().await {
            Ok(current) => current.block_number,
            Err(e) => {
                warn!(block_number = %block.block_number, error = %e, "reconcile: cannot read cursor");
                return false;
            }
        };
        if !needs_recrawl(block.block_number, cursor, self.unstable_number) {
            return false;
        }

        let request = CrawlRequest::new(block.block_number, true);
        let payload = match request.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(block_number = %block.block_number, error = %e, "reconcile: encode failed");
                return false;
            }
        };
        let key = random_key();
        match self.broker.publish(&self.request_topic, &key, &payload).await {
            Ok(()) => {
                debug!(block_number = %block.block_number, %cursor, message_key = %key, "reconcile: stable re-crawl enqueued");
                true
            }
            Err(e) => {
                warn!(block_number = %block.block_number, error = %e, "reconcile: publish failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: u64) -> BlockNumber {
        BlockNumber::from(v)
    }

    #[test]
    fn threshold() {
        assert!(needs_recrawl(n(975), n(1000), 20));
        assert!(!needs_recrawl(n(990), n(1000), 20));
        assert!(!needs_recrawl(n(980), n(1000), 20));
        assert!(needs_recrawl(n(979), n(1000), 20));
    }

    #[test]
    fn no_trigger_inside_first_window() {
        assert!(!needs_recrawl(n(0), n(10), 20));
        assert!(!needs_recrawl(n(0), n(20), 20));
        assert!(needs_recrawl(n(0), n(21), 20));
    }
}
