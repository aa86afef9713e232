//! The scheduler: turns chain-head progress into crawl requests.
//!
//! # Tick
//! Every `interval`:
//!   1. read the chain head
//!   2. read the persisted cursor, raising it to `start_at` if needed
//!   3. publish one [`CrawlRequest`] per block in the window
//!      `[max(cursor - unstable_number, start_at), min(start + batch_limit, head))`
//!   4. persist the first unpublished number as the new cursor
//!
//! The trailing `unstable_number` blocks are re-published on every tick so
//! that reorganized blocks get crawled again. A failing step skips the rest
//! of the tick; the next tick starts over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use chainsync_core::broker::{random_key, MessageBroker};
use chainsync_core::chain::ChainClient;
use chainsync_core::config::SchedulerConfig;
use chainsync_core::cursor::{CrawlWindow, Cursor};
use chainsync_core::error::SyncError;
use chainsync_core::number::BlockNumber;
use chainsync_core::service::{Lifecycle, Service, ServiceState};
use chainsync_core::store::BlockStore;
use chainsync_core::types::CrawlRequest;

use crate::worker::release;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub head: BlockNumber,
    /// Cursor read at the start of the tick, after clamping.
    pub cursor_before: BlockNumber,
    pub window: CrawlWindow,
    /// Number of requests actually published.
    pub published: u64,
    pub cursor_after: BlockNumber,
}

pub struct Scheduler {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn BlockStore>,
    broker: Arc<dyn MessageBroker>,
    cursor: Cursor,
    request_topic: String,
    interval: Duration,
    owns_handles: bool,
    lifecycle: Lifecycle,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        request_topic: impl Into<String>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn BlockStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            chain,
            store,
            broker,
            cursor: Cursor::new(config.start_at, config.unstable_number, config.batch_limit),
            request_topic: request_topic.into(),
            interval: config.interval(),
            owns_handles: true,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Leave the chain client, store and broker open on stop. Their owner
    /// closes them.
    pub fn sharing_handles(mut self) -> Self {
        self.owns_handles = false;
        self
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// Run one tick. Errors abort the tick and leave the cursor untouched,
    /// except that a publish failure only cuts the batch short.
    pub async fn tick(&self) -> Result<TickReport, SyncError> {
        self.lifecycle.set_state(ServiceState::ReconcileCursor);
        let result = self.run_tick().await;
        self.lifecycle.set_state(ServiceState::Idle);
        result
    }

    async fn run_tick(&self) -> Result<TickReport, SyncError> {
        let head = self.chain.current_height().await?;
        debug!(%head, "chain head");

        let mut cursor = self.store.current_block_number().await?.block_number;
        if let Some(clamped) = self.cursor.clamp(cursor) {
            self.store.update_current_block_number(clamped, head).await?;
            info!(from = %cursor, to = %clamped, "cursor raised to start_at");
            cursor = clamped;
        }

        self.lifecycle.set_state(ServiceState::EnqueueBatch);
        let window = self.cursor.window(cursor, head);
        let mut reached = window.start;
        for block_number in window.iter() {
            let payload = CrawlRequest::new(block_number, false).encode()?;
            let key = random_key();
            if let Err(e) = self.broker.publish(&self.request_topic, &key, &payload).await {
                error!(%block_number, error = %e, "publish crawl request failed");
                break;
            }
            debug!(%block_number, message_key = %key, "crawl request published");
            reached = block_number.next();
        }

        let cursor_after = self.cursor.advance(cursor, reached);
        self.store
            .update_current_block_number(cursor_after, head)
            .await?;

        let published = count(window.start, reached);
        Ok(TickReport {
            head,
            cursor_before: cursor,
            window,
            published,
            cursor_after,
        })
    }
}

fn count(from: BlockNumber, to: BlockNumber) -> u64 {
    let span = to.as_u256().saturating_sub(from.as_u256());
    BlockNumber::from(span).to_u64().unwrap_or(u64::MAX)
}

#[async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn start(&self) -> Result<(), SyncError> {
        self.lifecycle.begin(self.name())?;
        let shutdown = self.lifecycle.token();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            topic = %self.request_topic,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match tokio::time::timeout(self.interval, self.tick()).await {
                        Ok(Ok(report)) => info!(
                            head = %report.head,
                            cursor = %report.cursor_after,
                            published = report.published,
                            "tick complete"
                        ),
                        Ok(Err(e)) => error!(error = %e, "tick failed"),
                        Err(_) => {
                            self.lifecycle.set_state(ServiceState::Idle);
                            warn!(timeout_ms = self.interval.as_millis() as u64, "tick timed out");
                        }
                    }
                }
            }
        }

        self.lifecycle.finish();
        info!("scheduler stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        if !self.lifecycle.shutdown().await {
            return Ok(());
        }
        if !self.owns_handles {
            return Ok(());
        }
        release(Some(self.chain.as_ref()), self.store.as_ref(), self.broker.as_ref()).await
    }
}
