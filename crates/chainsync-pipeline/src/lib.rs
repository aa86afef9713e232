//! chainsync-pipeline: the components that move blocks from the chain into storage.
//!
//! ```text
//! Scheduler ──CrawlRequest──▶ crawler.topic ──▶ Crawler ──Block──▶ writer.topic ──▶ DatabaseWriter
//!                                                  │                                     │
//!                                                  └──── provisional header ──▶ BlockStore ◀┘
//! ```
//!
//! [`Worker`] runs all three components in one process over shared handles.
//!
//! [`BlockQuery`] is the read path; it feeds unstable blocks that have left
//! the unstable window back into `crawler.topic` as stable requests.

pub mod crawler;
pub mod query;
pub mod scheduler;
pub mod transform;
pub mod worker;
pub mod writer;

pub use crawler::{CrawlHandler, Crawler};
pub use query::{BlockHeaderView, BlockList, BlockQuery, BlockView, LogView, TransactionView};
pub use scheduler::{Scheduler, TickReport};
pub use worker::Worker;
pub use writer::{DatabaseWriter, WriteHandler};
