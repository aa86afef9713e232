//! Message broker abstraction.
//!
//! Components never talk to each other directly: the scheduler publishes
//! crawl requests, crawler workers consume them and publish finalized blocks,
//! and the database writer consumes those. Every driver delivers through the
//! same contract:
//!
//! - `Ok(())` from the handler acknowledges the message.
//! - [`HandleError::Terminal`] acknowledges it and reports the error.
//! - [`HandleError::Retryable`] leaves it uncommitted for redelivery and
//!   reports the error.
//! - A panic inside the handler is caught and treated as terminal.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{HandleError, SyncError};

/// Observer run before every handler invocation. Must not block.
pub type Middleware = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Receives every handler error and every failed acknowledgement.
pub type ErrorCallback = Arc<dyn Fn(&str, &SyncError) + Send + Sync>;

/// Processes one delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, key: &str, payload: &[u8]) -> Result<(), HandleError>;
}

/// Publish/subscribe over a durable, key-addressed log.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Driver name for logs (`"memory"`, `"kafka"`, `"confluent"`).
    fn name(&self) -> &'static str;

    /// Publish `payload` under `key`. An empty key is replaced by a random one.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), SyncError>;

    /// Consume `topic` with `worker_count` concurrent workers until `cancel`
    /// fires or the broker is closed. In-flight messages finish before this
    /// returns.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        worker_count: usize,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        on_error: Vec<ErrorCallback>,
    ) -> Result<(), SyncError>;

    /// Install an observer. Observers run in registration order.
    fn register_middleware(&self, middleware: Middleware);

    /// Stop all subscriptions and release the connection. Idempotent.
    async fn close(&self) -> Result<(), SyncError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandleError>> + Send,
{
    async fn handle(&self, key: &str, payload: &[u8]) -> Result<(), HandleError> {
        (self.0)(key.to_string(), payload.to_vec()).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandleError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Error callback that logs through `tracing` under the given component name.
pub fn log_errors(component: &'static str) -> ErrorCallback {
    Arc::new(move |key: &str, error: &SyncError| {
        tracing::error!(component, message_key = key, error = %error, "message handling failed");
    })
}

/// A fresh random message key.
pub fn random_key() -> String {
    uuid::Uuid::new_v4().to_string()
}
