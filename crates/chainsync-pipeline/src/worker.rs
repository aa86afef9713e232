//! All-in-one worker: scheduler, crawler and writer in one process.
//!
//! The three components share a single chain client, store and broker. With
//! the in-memory broker this is the only way requests published by the
//! scheduler reach a crawler. The worker owns the shared handles and closes
//! them once every component has drained.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chainsync_core::broker::MessageBroker;
use chainsync_core::chain::ChainClient;
use chainsync_core::config::SyncConfig;
use chainsync_core::error::SyncError;
use chainsync_core::service::{Lifecycle, Service, ServiceState};
use chainsync_core::store::BlockStore;

use crate::crawler::Crawler;
use crate::scheduler::Scheduler;
use crate::writer::DatabaseWriter;

/// Close every handle, then report the first failure.
pub(crate) async fn release(
    chain: Option<&dyn ChainClient>,
    store: &dyn BlockStore,
    broker: &dyn MessageBroker,
) -> Result<(), SyncError> {
    if let Some(chain) = chain {
        chain.close().await;
    }
    let stored = store.close().await;
    if let Err(e) = &stored {
        error!(error = %e, "failed to close storage");
    }
    let brokered = broker.close().await;
    if let Err(e) = &brokered {
        error!(error = %e, broker = broker.name(), "failed to close message broker");
    }
    stored.and(brokered)
}

pub struct Worker {
    scheduler: Scheduler,
    crawler: Crawler,
    writer: DatabaseWriter,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn BlockStore>,
    broker: Arc<dyn MessageBroker>,
    lifecycle: Lifecycle,
}

impl Worker {
    pub fn new(
        config: &SyncConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn BlockStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        let scheduler = Scheduler::new(
            &config.scheduler,
            config.crawler.topic.clone(),
            chain.clone(),
            store.clone(),
            broker.clone(),
        )
        .sharing_handles();
        let crawler = Crawler::new(
            &config.crawler,
            &config.writer,
            chain.clone(),
            store.clone(),
            broker.clone(),
        )
        .sharing_handles();
        let writer = DatabaseWriter::new(&config.writer, store.clone(), broker.clone())
            .sharing_handles();
        Self {
            scheduler,
            crawler,
            writer,
            chain,
            store,
            broker,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// Stop the components upstream first so in-flight work can still be
    /// handed downstream.
    async fn halt_components(&self) {
        let components: [&dyn Service; 3] = [&self.scheduler, &self.crawler, &self.writer];
        for component in components {
            if let Err(e) = component.stop().await {
                warn!(component = component.name(), error = %e, "component did not stop cleanly");
            }
        }
    }
}

/// Run `component` and stop the whole worker once it returns.
async fn supervise(component: &dyn Service, halt: &CancellationToken) -> Result<(), SyncError> {
    let result = component.start().await;
    if !halt.is_cancelled() {
        match &result {
            Ok(()) => warn!(component = component.name(), "component exited, stopping worker"),
            Err(e) => error!(
                component = component.name(),
                error = %e,
                "component failed, stopping worker"
            ),
        }
        halt.cancel();
    }
    result
}

#[async_trait]
impl Service for Worker {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn start(&self) -> Result<(), SyncError> {
        self.lifecycle.begin(self.name())?;
        self.lifecycle.set_state(ServiceState::Consuming);
        let halt = self.lifecycle.token();
        info!(broker = self.broker.name(), "worker started");

        let (scheduled, crawled, written, ()) = tokio::join!(
            supervise(&self.scheduler, &halt),
            supervise(&self.crawler, &halt),
            supervise(&self.writer, &halt),
            async {
                halt.cancelled().await;
                self.halt_components().await;
            },
        );

        self.lifecycle.finish();
        info!("worker stopped");
        scheduled.and(crawled).and(written)
    }

    async fn stop(&self) -> Result<(), SyncError> {
        if !self.lifecycle.shutdown().await {
            return Ok(());
        }
        release(Some(self.chain.as_ref()), self.store.as_ref(), self.broker.as_ref()).await
    }
}
