//! Native-protocol Kafka driver with explicit consumer-group control.
//!
//! A single `BaseConsumer` serves every subscription of the process. One
//! blocking poll loop reads the event stream and routes each record to the
//! channel of its topic; the shared worker pool consumes from there. Record
//! values are [`Envelope`]s. With auto-commit enabled acknowledgements are
//! no-ops; otherwise an ack commits the partition up to its lowest record
//! still in flight.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainsync_core::broker::{random_key, ErrorCallback, MessageBroker, MessageHandler, Middleware};
use chainsync_core::config::ConfluentOptions;
use chainsync_core::error::SyncError;

use crate::delivery::{Acknowledge, AutoCommit, Delivery, DeliverySource};
use crate::envelope::Envelope;
use crate::middleware::{audit_log, Middlewares};
use crate::offsets::OffsetTracker;
use crate::worker::WorkerPool;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

fn broker_err(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Broker(format!("confluent {context}: {e}"))
}

type Routes = Arc<RwLock<HashMap<String, mpsc::Sender<Delivery>>>>;

// ─── Client contexts ──────────────────────────────────────────────────────────

/// Logs group membership changes and offset commits, and forgets the commit
/// state of revoked partitions.
struct GroupContext {
    group_id: String,
    instance_id: String,
    tracker: Arc<OffsetTracker>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        info!(group = %self.group_id, instance = %self.instance_id, ?rebalance, "rebalance starting");
        if let Rebalance::Revoke(partitions) = rebalance {
            for partition in partitions.elements() {
                self.tracker.forget(partition.topic(), partition.partition());
            }
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        info!(group = %self.group_id, instance = %self.instance_id, ?rebalance, "rebalance complete");
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(group = %self.group_id, ?offsets, "offsets committed"),
            Err(e) => error!(group = %self.group_id, error = %e, "offset commit failed"),
        }
    }
}

/// Logs producer delivery failures.
struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((e, message)) = result {
            error!(topic = message.topic(), error = %e, "confluent delivery failed");
        }
    }
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Options with process-specific identities resolved.
#[derive(Debug, Clone)]
struct ResolvedOptions {
    options: ConfluentOptions,
    group_id: String,
    instance_id: String,
}

impl ResolvedOptions {
    fn resolve(options: &ConfluentOptions) -> Self {
        let group_id = if options.group_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            options.group_id.clone()
        };
        let instance_id = if options.group_instance_id.is_empty() {
            std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
        } else {
            options.group_instance_id.clone()
        };
        Self {
            options: options.clone(),
            group_id,
            instance_id,
        }
    }

    fn base(&self) -> ClientConfig {
        let o = &self.options;
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", o.brokers.join(","))
            .set("security.protocol", &o.security_protocol)
            .set("sasl.mechanisms", &o.sasl_mechanisms);
        if !o.client_id.is_empty() {
            config.set("client.id", &o.client_id);
        }
        if !o.sasl_username.is_empty() {
            config
                .set("sasl.username", &o.sasl_username)
                .set("sasl.password", &o.sasl_password);
        }
        config
    }

    fn consumer_config(&self) -> ClientConfig {
        let o = &self.options;
        let mut config = self.base();
        config
            .set("group.id", &self.group_id)
            .set("group.instance.id", &self.instance_id)
            .set("auto.offset.reset", o.offsets_initial.as_str())
            .set("fetch.min.bytes", "1")
            .set("heartbeat.interval.ms", o.heartbeat_interval_ms.to_string())
            .set("session.timeout.ms", o.session_timeout_ms.to_string())
            .set("enable.auto.commit", o.enable_auto_commit.to_string())
            .set("auto.commit.interval.ms", o.auto_commit_interval_ms.to_string())
            .set("max.partition.fetch.bytes", o.max_partition_fetch_bytes.to_string())
            .set("fetch.max.bytes", o.fetch_max_bytes.to_string())
            .set("max.poll.interval.ms", "300000")
            .set("metadata.max.age.ms", "300000")
            .set("partition.assignment.strategy", &o.rebalance_strategy);
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let o = &self.options;
        let mut config = self.base();
        config
            .set("acks", o.acks_setting())
            .set("compression.type", &o.compression_type)
            .set("retries", o.retries.to_string())
            .set("batch.size", o.batch_size.to_string());
        config
    }
}

// ─── Broker ───────────────────────────────────────────────────────────────────

/// Native-protocol Kafka [`MessageBroker`].
pub struct ConfluentBroker {
    resolved: ResolvedOptions,
    consumer: Arc<BaseConsumer<GroupContext>>,
    tracker: Arc<OffsetTracker>,
    producer: ThreadedProducer<DeliveryLogger>,
    routes: Routes,
    topics: Mutex<BTreeSet<String>>,
    middlewares: Middlewares,
    running: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ConfluentBroker {
    pub fn connect(options: &ConfluentOptions) -> Result<Self, SyncError> {
        let resolved = ResolvedOptions::resolve(options);

        let producer: ThreadedProducer<DeliveryLogger> = resolved
            .producer_config()
            .create_with_context(DeliveryLogger)
            .map_err(|e| broker_err("producer", e))?;
        let tracker = Arc::new(OffsetTracker::new());
        let consumer: BaseConsumer<GroupContext> = resolved
            .consumer_config()
            .create_with_context(GroupContext {
                group_id: resolved.group_id.clone(),
                instance_id: resolved.instance_id.clone(),
                tracker: tracker.clone(),
            })
            .map_err(|e| broker_err("consumer", e))?;

        let middlewares = Middlewares::new();
        middlewares.register(audit_log("confluent"));
        info!(
            brokers = ?options.brokers,
            group = %resolved.group_id,
            instance = %resolved.instance_id,
            auto_commit = options.enable_auto_commit,
            "confluent broker connected"
        );

        Ok(Self {
            resolved,
            consumer: Arc::new(consumer),
            tracker,
            producer,
            routes: Arc::default(),
            topics: Mutex::new(BTreeSet::new()),
            middlewares,
            running: Arc::new(AtomicBool::new(true)),
            poller: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Re-subscribe the consumer to the current topic set.
    fn sync_subscription(&self) -> Result<(), SyncError> {
        let topics = self
            .topics
            .lock()
            .map_err(|_| SyncError::Broker("confluent topic set poisoned".into()))?;
        if topics.is_empty() {
            self.consumer.unsubscribe();
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| broker_err("subscribe", e))
    }

    fn ensure_poller(&self) {
        let Ok(mut poller) = self.poller.lock() else {
            return;
        };
        if poller.is_some() {
            return;
        }
        let poll = PollLoop {
            consumer: self.consumer.clone(),
            tracker: self.tracker.clone(),
            routes: self.routes.clone(),
            running: self.running.clone(),
            poll_timeout: Duration::from_millis(self.resolved.options.poll_timeout_ms),
            auto_commit: self.resolved.options.enable_auto_commit,
            group_id: self.resolved.group_id.clone(),
        };
        *poller = Some(tokio::task::spawn_blocking(move || poll.run()));
    }

    fn remove_route(&self, topic: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(topic);
        }
        if let Ok(mut topics) = self.topics.lock() {
            topics.remove(topic);
        }
    }
}

#[async_trait]
impl MessageBroker for ConfluentBroker {
    fn name(&self) -> &'static str {
        "confluent"
    }

    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), SyncError> {
        if !self.is_running() {
            return Err(SyncError::Closed("confluent broker"));
        }
        let key = if key.is_empty() { random_key() } else { key.to_string() };
        let value = Envelope::new(key.as_str(), payload).encode()?;
        self.producer
            .send(BaseRecord::to(topic).key(key.as_str()).payload(&value))
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
        if !self.is_running() {
            return Err(SyncError::Closed("confluent broker"));
        }
        let (tx, rx) = mpsc::channel(worker_count.max(1));
        self.routes
            .write()
            .map_err(|_| SyncError::Broker("confluent routes poisoned".into()))?
            .insert(topic.to_string(), tx);
        self.topics
            .lock()
            .map_err(|_| SyncError::Broker("confluent topic set poisoned".into()))?
            .insert(topic.to_string());
        if let Err(e) = self.sync_subscription() {
            self.remove_route(topic);
            return Err(e);
        }
        self.ensure_poller();

        let source: Arc<dyn DeliverySource> = Arc::new(tokio::sync::Mutex::new(rx));
        let pool = WorkerPool::new(topic, source, handler, on_error, self.middlewares.clone());
        pool.run_until(worker_count, cancel.child_token(), &self.shutdown)
            .await;

        self.remove_route(topic);
        if self.is_running() {
            if let Err(e) = self.sync_subscription() {
                warn!(topic, error = %e, "confluent resubscribe failed");
            }
        }
        debug!(topic, "confluent subscription closed");
        Ok(())
    }

    fn register_middleware(&self, middleware: Middleware) {
        self.middlewares.register(middleware);
    }

    async fn close(&self) -> Result<(), SyncError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        if let Ok(mut routes) = self.routes.write() {
            routes.clear();
        }

        let poller = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                warn!(error = %e, "confluent poll loop aborted");
            }
        }
        self.consumer.unsubscribe();

        let flush_wait = Duration::from_millis(self.resolved.options.flush_wait_ms);
        let flushed = self.producer.flush(flush_wait);
        info!("confluent broker closed");
        flushed.map_err(|e| broker_err("flush", e))
    }
}

/// Blocking event loop: routes records to their topic's channel.
///
/// Every record is tracked as in flight before routing. A record that no
/// subscription takes is never acknowledged, so it holds its partition's
/// commit position and is fetched again after a restart or rebalance.
struct PollLoop {
    consumer: Arc<BaseConsumer<GroupContext>>,
    tracker: Arc<OffsetTracker>,
    routes: Routes,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
    auto_commit: bool,
    group_id: String,
}

impl PollLoop {
    fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            let message = match self.consumer.poll(self.poll_timeout) {
                None => continue,
                Some(Err(e)) => {
                    error!(group = %self.group_id, error = %e, "confluent poll error");
                    continue;
                }
                Some(Ok(message)) => message,
            };

            let topic = message.topic().to_string();
            let partition = message.partition();
            let offset = message.offset();
            if !self.auto_commit {
                self.tracker.delivered(&topic, partition, offset);
            }

            let envelope = match Envelope::decode(message.payload().unwrap_or_default()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Undecodable records would otherwise block the partition forever.
                    error!(topic = %topic, partition, offset, error = %e, "dropping malformed record");
                    if !self.auto_commit {
                        if let Some(next) = self.tracker.acked(&topic, partition, offset) {
                            if let Err(e) = commit(&self.consumer, &topic, partition, next) {
                                error!(topic = %topic, partition, offset, error = %e, "confluent commit failed");
                            }
                        }
                    }
                    continue;
                }
            };
            debug!(
                topic = %topic,
                partition,
                offset,
                group = %self.group_id,
                request_id = %envelope.request_id,
                consume_id = %envelope.consume_id,
                "confluent access log"
            );

            let sender = self.routes.read().ok().and_then(|r| r.get(&topic).cloned());
            let Some(sender) = sender else {
                warn!(topic = %topic, partition, offset, "no subscription for record; left uncommitted");
                continue;
            };
            let acker: Box<dyn Acknowledge> = if self.auto_commit {
                Box::new(AutoCommit)
            } else {
                Box::new(ConfluentAck {
                    consumer: self.consumer.clone(),
                    tracker: self.tracker.clone(),
                    topic: topic.clone(),
                    partition,
                    offset,
                })
            };
            let delivery = Delivery::new(envelope.request_id, envelope.data.to_vec(), acker);
            if sender.blocking_send(delivery).is_err() {
                warn!(topic = %topic, partition, offset, "subscription gone; record left uncommitted");
            }
        }
        debug!(group = %self.group_id, "confluent poll loop stopped");
    }
}

/// Commit `partition` so the group resumes at `next`.
fn commit(
    consumer: &BaseConsumer<GroupContext>,
    topic: &str,
    partition: i32,
    next: i64,
) -> Result<(), SyncError> {
    let mut offsets = TopicPartitionList::new();
    offsets
        .add_partition_offset(topic, partition, Offset::Offset(next))
        .map_err(|e| broker_err("commit", e))?;
    consumer
        .commit(&offsets, CommitMode::Async)
        .map_err(|e| broker_err("commit", e))
}

struct ConfluentAck {
    consumer: Arc<BaseConsumer<GroupContext>>,
    tracker: Arc<OffsetTracker>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl Acknowledge for ConfluentAck {
    async fn ack(&self) -> Result<(), SyncError> {
        match self.tracker.acked(&self.topic, self.partition, self.offset) {
            Some(next) => commit(&self.consumer, &self.topic, self.partition, next),
            None => Ok(()),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_identities_are_kept() {
        let options = ConfluentOptions {
            group_id: "sync".into(),
            group_instance_id: "crawler-0".into(),
            ..ConfluentOptions::default()
        };
        let resolved = ResolvedOptions::resolve(&options);
        let consumer = resolved.consumer_config();
        assert_eq!(consumer.get("group.id"), Some("sync"));
        assert_eq!(consumer.get("group.instance.id"), Some("crawler-0"));
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn empty_group_gets_a_fresh_id() {
        let options = ConfluentOptions {
            group_id: String::new(),
            ..ConfluentOptions::default()
        };
        let a = ResolvedOptions::resolve(&options);
        let b = ResolvedOptions::resolve(&options);
        assert_eq!(a.group_id.len(), 36);
        assert_ne!(a.group_id, b.group_id);
    }

    #[test]
    fn producer_maps_acks_and_skips_empty_credentials() {
        let options = ConfluentOptions {
            acks: 3,
            ..ConfluentOptions::default()
        };
        let producer = ResolvedOptions::resolve(&options).producer_config();
        assert_eq!(producer.get("acks"), Some("-1"));
        assert_eq!(producer.get("sasl.username"), None);
    }
}
