//! Wiring of configured drivers into pipeline components.
//!
//! Failing to reach the broker, the storage or the upstream node here is the
//! only fatal error a process can hit.

use std::sync::Arc;

use anyhow::Context;

use chainsync_core::{BlockStore, ChainClient, MessageBroker, Reconciler, SyncConfig};
use chainsync_pipeline::{BlockQuery, Crawler, DatabaseWriter, Scheduler, Worker};
use chainsync_rpc::EvmChainClient;

pub async fn store(config: &SyncConfig) -> anyhow::Result<Arc<dyn BlockStore>> {
    chainsync_storage::connect(&config.database)
        .await
        .context("failed to connect storage")
}

pub fn broker(config: &SyncConfig) -> anyhow::Result<Arc<dyn MessageBroker>> {
    chainsync_broker::connect(&config.broker).context("failed to connect message broker")
}

pub async fn chain(config: &SyncConfig) -> anyhow::Result<Arc<dyn ChainClient>> {
    config.require_rpc()?;
    let client = EvmChainClient::from_config(&config.rpc)
        .await
        .with_context(|| format!("failed to connect upstream node {}", config.rpc.url))?;
    tracing::info!(chain_id = client.chain_id(), "upstream node connected");
    Ok(Arc::new(client))
}

pub async fn scheduler(config: &SyncConfig) -> anyhow::Result<Scheduler> {
    let broker = broker(config)?;
    let store = store(config).await?;
    let chain = chain(config).await?;
    Ok(Scheduler::new(
        &config.scheduler,
        config.crawler.topic.clone(),
        chain,
        store,
        broker,
    ))
}

pub async fn crawler(config: &SyncConfig) -> anyhow::Result<Crawler> {
    let broker = broker(config)?;
    let store = store(config).await?;
    let chain = chain(config).await?;
    Ok(Crawler::new(
        &config.crawler,
        &config.writer,
        chain,
        store,
        broker,
    ))
}

pub async fn writer(config: &SyncConfig) -> anyhow::Result<DatabaseWriter> {
    let broker = broker(config)?;
    let store = store(config).await?;
    Ok(DatabaseWriter::new(&config.writer, store, broker))
}

/// Scheduler, crawler and writer over one broker and store, plus a read path
/// on the same handles. The worker closes them on stop.
pub async fn worker(config: &SyncConfig) -> anyhow::Result<(Worker, BlockQuery)> {
    let broker = broker(config)?;
    let store = store(config).await?;
    let chain = chain(config).await?;
    let query = query(config, store.clone(), broker.clone());
    Ok((Worker::new(config, chain, store, broker), query))
}

fn query(config: &SyncConfig, store: Arc<dyn BlockStore>, broker: Arc<dyn MessageBroker>) -> BlockQuery {
    let reconciler = Reconciler::new(
        broker,
        store.clone(),
        config.crawler.topic.clone(),
        config.scheduler.unstable_number,
    );
    BlockQuery::new(store, reconciler, config.http.default_limit)
}

/// Read path plus the handles it must release on shutdown.
pub struct ReadPath {
    pub query: BlockQuery,
    pub store: Arc<dyn BlockStore>,
    pub broker: Arc<dyn MessageBroker>,
}

pub async fn read_path(config: &SyncConfig) -> anyhow::Result<ReadPath> {
    let broker = broker(config)?;
    let store = store(config).await?;
    Ok(ReadPath {
        query: query(config, store.clone(), broker.clone()),
        store,
        broker,
    })
}
