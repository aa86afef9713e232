//! In-process broker for development and tests.
//!
//! Each topic is a FIFO queue. A nack puts the message back at the tail of
//! its topic, so a retryable failure is redelivered after whatever else is
//! already queued. The most recent published and committed records of each
//! topic are kept for inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chainsync_core::broker::{random_key, ErrorCallback, MessageBroker, MessageHandler, Middleware};
use chainsync_core::error::SyncError;

use crate::delivery::{Acknowledge, Delivery, DeliverySource};
use crate::middleware::{audit_log, Middlewares};
use crate::worker::WorkerPool;

/// A message as stored by the memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Records kept per topic and log by [`MemoryBroker::new`].
pub const DEFAULT_HISTORY: usize = 1024;

struct Topic {
    sender: mpsc::UnboundedSender<Delivery>,
    source: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    published: VecDeque<Record>,
    committed: VecDeque<Record>,
    redelivered: usize,
}

impl Topic {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            source: Arc::new(tokio::sync::Mutex::new(receiver)),
            published: VecDeque::new(),
            committed: VecDeque::new(),
            redelivered: 0,
        }
    }
}

fn remember(log: &mut VecDeque<Record>, record: Record, limit: usize) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back(record);
}

struct Inner {
    topics: Mutex<HashMap<String, Topic>>,
    history: usize,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    fn with_topic<T>(&self, topic: &str, f: impl FnOnce(&mut Topic) -> T) -> Result<T, SyncError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| SyncError::Broker("memory broker lock poisoned".into()))?;
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        Ok(f(entry))
    }

    fn enqueue(self: &Arc<Self>, record: Record) -> Result<(), SyncError> {
        let delivery = Delivery::new(
            record.key.clone(),
            record.payload.clone(),
            Box::new(MemoryAck {
                inner: self.clone(),
                record: record.clone(),
            }),
        );
        self.with_topic(&record.topic, |t| t.sender.send(delivery))?
            .map_err(|_| SyncError::Broker(format!("topic {} is gone", record.topic)))
    }
}

/// In-memory [`MessageBroker`].
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
    middlewares: Middlewares,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Broker keeping the last `history` published and committed records
    /// per topic. Zero keeps none.
    pub fn with_history(history: usize) -> Self {
        let middlewares = Middlewares::new();
        middlewares.register(audit_log("memory"));
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::default(),
                history,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
            middlewares,
        }
    }

    /// Most recent messages published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Record> {
        self.inner
            .with_topic(topic, |t| t.published.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent messages acknowledged on `topic`, in acknowledgement order.
    pub fn committed(&self, topic: &str) -> Vec<Record> {
        self.inner
            .with_topic(topic, |t| t.committed.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of nacked deliveries on `topic`.
    pub fn redelivered(&self, topic: &str) -> usize {
        self.inner.with_topic(topic, |t| t.redelivered).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed("memory broker"));
        }
        let key = if key.is_empty() { random_key() } else { key.to_string() };
        let record = Record {
            topic: topic.to_string(),
            key,
            payload: payload.to_vec(),
            attempt: 1,
        };
        let history = self.inner.history;
        self.inner
            .with_topic(topic, |t| remember(&mut t.published, record.clone(), history))?;
        self.inner.enqueue(record)
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        worker_count: usize,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        on_error: Vec<ErrorCallback>,
    ) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed("memory broker"));
        }
        let source: Arc<dyn DeliverySource> = self.inner.with_topic(topic, |t| t.source.clone())?;
        let pool = WorkerPool::new(topic, source, handler, on_error, self.middlewares.clone());

        pool.run_until(worker_count, cancel.child_token(), &self.inner.shutdown)
            .await;
        Ok(())
    }

    fn register_middleware(&self, middleware: Middleware) {
        self.middlewares.register(middleware);
    }

    async fn close(&self) -> Result<(), SyncError> {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.cancel();
            tracing::debug!("memory broker closed");
        }
        Ok(())
    }
}

struct MemoryAck {
    inner: Arc<Inner>,
    record: Record,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(&self) -> Result<(), SyncError> {
        let record = self.record.clone();
        let history = self.inner.history;
        self.inner
            .with_topic(&self.record.topic, |t| remember(&mut t.committed, record, history))
    }

    async fn nack(&self) -> Result<(), SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.with_topic(&self.record.topic, |t| t.redelivered += 1)?;
        let mut record = self.record.clone();
        record.attempt += 1;
        self.inner.enqueue(record)
    }
}
