//! chainsync-core: data model and seams for the reorg-tolerant block pipeline.
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──(crawl requests)──▶ MessageBroker ──▶ Crawler ──▶ ChainClient
//!     ▲                                                │
//!     │                                   provisional  │  finalized blocks
//!  BlockStore ◀────────────────────────────────────────┤
//!     ▲                                                ▼
//!     └────────────── Writer ◀──────────────── MessageBroker
//!
//! read path: BlockQuery ──▶ Reconciler ──(stable re-crawl)──▶ MessageBroker
//! ```

pub mod broker;
pub mod chain;
pub mod config;
pub mod cursor;
pub mod error;
pub mod number;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod types;

pub use broker::{ErrorCallback, MessageBroker, MessageHandler, Middleware};
pub use chain::{ChainBlock, ChainClient, ChainLog, ChainReceipt, ChainTransaction};
pub use config::SyncConfig;
pub use cursor::{CrawlWindow, Cursor};
pub use error::{HandleError, SyncError};
pub use number::BlockNumber;
pub use reconcile::Reconciler;
pub use service::{Lifecycle, Service, ServiceState};
pub use store::BlockStore;
pub use types::{Block, CrawlRequest, CurrentBlockNumber, Transaction, TransactionLog};
