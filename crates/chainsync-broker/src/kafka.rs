//! Kafka driver over `rdkafka`'s async client.
//!
//! One `FutureProducer` per broker, one `StreamConsumer` per subscription.
//! An ack commits the partition up to its lowest record still in flight; a
//! nack seeks the partition back to the record so it is fetched again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainsync_core::broker::{random_key, ErrorCallback, MessageBroker, MessageHandler, Middleware};
use chainsync_core::config::KafkaOptions;
use chainsync_core::error::SyncError;

use crate::delivery::{Acknowledge, Delivery, DeliverySource};
use crate::middleware::{audit_log, Middlewares};
use crate::offsets::OffsetTracker;
use crate::worker::WorkerPool;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

fn broker_err(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Broker(format!("kafka {context}: {e}"))
}

type TrackedConsumer = StreamConsumer<RevokeContext>;

/// Drops commit state for partitions taken away by a rebalance.
struct RevokeContext {
    tracker: Arc<OffsetTracker>,
}

impl ClientContext for RevokeContext {}

impl ConsumerContext for RevokeContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            for partition in partitions.elements() {
                self.tracker.forget(partition.topic(), partition.partition());
            }
        }
    }
}

/// Client-library Kafka [`MessageBroker`].
pub struct KafkaBroker {
    options: KafkaOptions,
    producer: FutureProducer,
    middlewares: Middlewares,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl KafkaBroker {
    pub fn connect(options: &KafkaOptions) -> Result<Self, SyncError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", options.brokers.join(","))
            .set("acks", options.required_acks.to_string())
            .set("message.timeout.ms", options.message_timeout_ms.to_string())
            .create()
            .map_err(|e| broker_err("producer", e))?;

        let middlewares = Middlewares::new();
        middlewares.register(audit_log("kafka"));
        info!(brokers = ?options.brokers, group = %options.consumer_group, "kafka broker connected");

        Ok(Self {
            options: options.clone(),
            producer,
            middlewares,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn consumer(&self, tracker: Arc<OffsetTracker>) -> Result<TrackedConsumer, SyncError> {
        ClientConfig::new()
            .set("bootstrap.servers", self.options.brokers.join(","))
            .set("group.id", &self.options.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", self.options.offsets_initial.as_str())
            .set(
                "max.partition.fetch.bytes",
                self.options.fetch_default.to_string(),
            )
            .create_with_context(RevokeContext { tracker })
            .map_err(|e| broker_err("consumer", e))
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed("kafka broker"));
        }
        let key = if key.is_empty() { random_key() } else { key.to_string() };
        let record = FutureRecord::to(topic).key(key.as_str()).payload(payload);
        self.producer
            .send(record, Duration::from_millis(self.options.message_timeout_ms))
            .await
            .map(|_| ())
            .map_err(|(e, _)| broker_err("publish", e))
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        worker_count: usize,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        on_error: Vec<ErrorCallback>,
    ) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed("kafka broker"));
        }
        let tracker = Arc::new(OffsetTracker::new());
        let consumer = Arc::new(self.consumer(tracker.clone())?);
        consumer
            .subscribe(&[topic])
            .map_err(|e| broker_err("subscribe", e))?;

        let stop = cancel.child_token();
        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let pump = tokio::spawn(pump(
            consumer.clone(),
            tracker,
            tx,
            stop.clone(),
            self.shutdown.clone(),
        ));

        let source: Arc<dyn DeliverySource> = Arc::new(tokio::sync::Mutex::new(rx));
        let pool = WorkerPool::new(topic, source, handler, on_error, self.middlewares.clone());
        pool.run_until(worker_count, stop.clone(), &self.shutdown)
            .await;

        stop.cancel();
        let _ = pump.await;
        consumer.unsubscribe();
        debug!(topic, "kafka subscription closed");
        Ok(())
    }

    fn register_middleware(&self, middleware: Middleware) {
        self.middlewares.register(middleware);
    }

    async fn close(&self) -> Result<(), SyncError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        info!("kafka broker closed");
        Ok(())
    }
}

/// Moves messages from the consumer stream into the workers' channel.
async fn pump(
    consumer: Arc<TrackedConsumer>,
    tracker: Arc<OffsetTracker>,
    tx: mpsc::Sender<Delivery>,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = stop.cancelled() => return,
            _ = shutdown.cancelled() => return,
            received = consumer.recv() => match received {
                Ok(message) => {
                    let key = message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .unwrap_or_default();
                    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    tracker.delivered(message.topic(), message.partition(), message.offset());
                    let acker = KafkaAck {
                        consumer: consumer.clone(),
                        tracker: tracker.clone(),
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                    };
                    Delivery::new(key, payload, Box::new(acker))
                }
                Err(e) => {
                    warn!(error = %e, "kafka consume error");
                    continue;
                }
            },
        };
        tokio::select! {
            _ = stop.cancelled() => return,
            sent = tx.send(delivery) => if sent.is_err() { return },
        }
    }
}

struct KafkaAck {
    consumer: Arc<TrackedConsumer>,
    tracker: Arc<OffsetTracker>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl Acknowledge for KafkaAck {
    async fn ack(&self) -> Result<(), SyncError> {
        let Some(next) = self.tracker.acked(&self.topic, self.partition, self.offset) else {
            return Ok(());
        };
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(next))
            .map_err(|e| broker_err("commit", e))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| broker_err("commit", e))
    }

    async fn nack(&self) -> Result<(), SyncError> {
        self.consumer
            .seek(
                &self.topic,
                self.partition,
                Offset::Offset(self.offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| broker_err("seek", e))
    }
}
