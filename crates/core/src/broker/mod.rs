//! Broker abstraction.
//!
//! The relay treats the message broker as a black box exposing assign, poll,
//! commit and produce. Backends:
//! - `kafka` (feature `kafka`): librdkafka through `rdkafka`
//! - `memory`: in-process partition log, used for simulation mode and tests

#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod types;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::{demo_route, MemoryBroker, ProducedRecord};
pub use types::*;

use std::sync::Arc;

use crate::config::{BrokerBackend, Config};

/// Build the broker selected by configuration.
pub fn create_broker(config: &Config) -> Result<Arc<dyn Broker>, BrokerError> {
    match config.broker.backend {
        BrokerBackend::Simulation => Ok(Arc::new(MemoryBroker::simulation(
            &config.broker,
            std::time::Duration::from_millis(config.relay.simulation_interval_ms),
        ))),
        #[cfg(feature = "kafka")]
        BrokerBackend::Kafka => Ok(Arc::new(KafkaBroker::new(config.broker.clone()))),
        #[cfg(not(feature = "kafka"))]
        BrokerBackend::Kafka => Err(BrokerError::Config(
            "kafka backend not compiled in (enable the `kafka` feature)".to_string(),
        )),
    }
}
