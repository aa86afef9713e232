//! chainsync-broker: message broker drivers for the chainsync pipeline.
//!
//! Every driver implements [`chainsync_core::MessageBroker`] and hands its
//! deliveries to the same [`WorkerPool`], so acknowledgement and panic
//! handling behave identically whichever driver is configured.
//!
//! | driver | feature | notes |
//! |---|---|---|
//! | [`MemoryBroker`] | always | single process, inspectable |
//! | `KafkaBroker` | `kafka` | `rdkafka` stream consumer per subscription |
//! | `ConfluentBroker` | `kafka` | one consumer, manual group/offset control, envelope records |

use std::sync::Arc;

use chainsync_core::config::{BrokerConfig, BrokerDriver};
use chainsync_core::error::SyncError;
use chainsync_core::MessageBroker;

pub mod delivery;
pub mod envelope;
pub mod memory;
pub mod middleware;
pub mod offsets;
pub mod worker;

#[cfg(feature = "kafka")]
pub mod confluent;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use delivery::{Acknowledge, Delivery, DeliverySource};
pub use envelope::Envelope;
pub use memory::{MemoryBroker, Record, DEFAULT_HISTORY};
pub use middleware::Middlewares;
pub use offsets::OffsetTracker;
pub use worker::WorkerPool;

#[cfg(feature = "kafka")]
pub use confluent::ConfluentBroker;
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;

/// Build the broker selected by `config.driver`.
pub fn connect(config: &BrokerConfig) -> Result<Arc<dyn MessageBroker>, SyncError> {
    tracing::info!(driver = %config.driver, "connecting message broker");
    match config.driver {
        BrokerDriver::Memory => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "kafka")]
        BrokerDriver::Kafka => Ok(Arc::new(KafkaBroker::connect(&config.kafka)?)),
        #[cfg(feature = "kafka")]
        BrokerDriver::Confluent => Ok(Arc::new(ConfluentBroker::connect(&config.confluent)?)),
        #[cfg(not(feature = "kafka"))]
        driver => Err(SyncError::Config(format!(
            "broker driver '{driver}' requires the `kafka` feature"
        ))),
    }
}
