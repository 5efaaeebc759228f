pub mod broker;
pub mod config;
pub mod messages;
pub mod metrics;
pub mod relay;
pub mod testing;

pub use broker::{create_broker, Broker, BrokerError, MemoryBroker};
pub use config::{
    load_config, load_config_from_str, validate_config, BrokerBackend, CheckpointSource,
    CommitPolicy, Config, ConfigError, SanitizedConfig,
};
pub use messages::{Checkpoint, DecodeError, Instruction, Ready};
pub use relay::{
    create_relay_service, start_relay_service, ActionResponse, ConnectivityReport, RelayError,
    RelayMessage, RelayService, RelayStats, RelayWorkers, ServiceStatus,
};
