//! The uniform shape every driver hands to the worker pool.

use async_trait::async_trait;
use tokio::sync::mpsc;

use chainsync_core::error::SyncError;

/// Commits or releases one delivered message.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Mark the message consumed.
    async fn ack(&self) -> Result<(), SyncError>;

    /// Leave the message uncommitted and make it available again.
    async fn nack(&self) -> Result<(), SyncError>;
}

/// A message pulled off a topic, ready for a worker.
pub struct Delivery {
    pub key: String,
    pub payload: Vec<u8>,
    pub acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(key: impl Into<String>, payload: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            key: key.into(),
            payload,
            acker,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// The per-topic channel workers pull deliveries from. Shared by all workers
/// of a subscription; each delivery goes to exactly one of them.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Next delivery, or `None` once the driver stopped feeding the topic.
    async fn next_delivery(&self) -> Option<Delivery>;
}

#[async_trait]
impl DeliverySource for tokio::sync::Mutex<mpsc::Receiver<Delivery>> {
    async fn next_delivery(&self) -> Option<Delivery> {
        self.lock().await.recv().await
    }
}

#[async_trait]
impl DeliverySource for tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>> {
    async fn next_delivery(&self) -> Option<Delivery> {
        self.lock().await.recv().await
    }
}

/// Acknowledger that does nothing, for drivers running with auto-commit.
pub struct AutoCommit;

#[async_trait]
impl Acknowledge for AutoCommit {
    async fn ack(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn nack(&self) -> Result<(), SyncError> {
        Ok(())
    }
}
