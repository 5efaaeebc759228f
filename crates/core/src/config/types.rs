use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    8000
}

/// Available broker backends
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// Kafka via librdkafka (requires the `kafka` cargo feature).
    Kafka,
    /// In-memory partition seeded with the demo route.
    #[default]
    Simulation,
}

impl BrokerBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerBackend::Kafka => "kafka",
            BrokerBackend::Simulation => "simulation",
        }
    }
}

/// Transport security mode, named as the broker client names them.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum SecurityProtocol {
    #[default]
    #[serde(rename = "PLAINTEXT")]
    Plaintext,
    #[serde(rename = "SSL")]
    Ssl,
    #[serde(rename = "SASL_PLAINTEXT")]
    SaslPlaintext,
    #[serde(rename = "SASL_SSL")]
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(
            self,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        )
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, SecurityProtocol::Ssl | SecurityProtocol::SaslSsl)
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    /// Bootstrap address list (e.g., "localhost:9092")
    #[serde(default)]
    pub bootstrap_servers: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    /// Consumer group used for offset storage and as checkpoint `group_id`
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Client id reported by the producer
    #[serde(default = "default_producer_client_id")]
    pub producer_client_id: String,
    #[serde(default = "default_instruction_topic")]
    pub instruction_topic: String,
    #[serde(default = "default_checkpoint_topic")]
    pub checkpoint_topic: String,
    /// Partition of the instruction topic this relay owns
    #[serde(default)]
    pub partition: i32,
    /// Offset floor; records below it are skipped. Unset resumes from the
    /// last committed offset (earliest when nothing was committed).
    #[serde(default)]
    pub start_offset: Option<i64>,
    /// Producer delivery timeout in seconds
    #[serde(default = "default_produce_timeout")]
    pub produce_timeout_secs: u64,
    /// Producer retries before a delivery is reported failed
    #[serde(default = "default_producer_retries")]
    pub producer_retries: u32,
}

fn default_consumer_group() -> String {
    "pilot".to_string()
}

fn default_producer_client_id() -> String {
    "relay-producer".to_string()
}

fn default_instruction_topic() -> String {
    "training_instructions".to_string()
}

fn default_checkpoint_topic() -> String {
    "training_checkpoint".to_string()
}

fn default_produce_timeout() -> u64 {
    10
}

fn default_producer_retries() -> u32 {
    3
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            bootstrap_servers: String::new(),
            security_protocol: SecurityProtocol::default(),
            sasl_username: None,
            sasl_password: None,
            consumer_group: default_consumer_group(),
            producer_client_id: default_producer_client_id(),
            instruction_topic: default_instruction_topic(),
            checkpoint_topic: default_checkpoint_topic(),
            partition: 0,
            start_offset: None,
            produce_timeout_secs: default_produce_timeout(),
            producer_retries: default_producer_retries(),
        }
    }
}

/// When the offset of a consumed instruction is committed.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit as soon as the instruction has been handed to the bridge.
    Immediate,
    /// Hold the commit until the step's checkpoint is acknowledged.
    #[default]
    OnCheckpoint,
}

/// Who produces checkpoints for delivered instructions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// The relay emits a checkpoint right after delivering an instruction.
    #[default]
    Auto,
    /// Checkpoints arrive through `POST /checkpoint`.
    External,
}

/// Relay engine tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub commit_policy: CommitPolicy,
    #[serde(default)]
    pub checkpoint_source: CheckpointSource,
    /// Poll timeout; bounds how long a stop request goes unnoticed
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Sleep after a transport error before polling again
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
    /// Capacity of the poller -> runtime channel
    #[serde(default = "default_bridge_capacity")]
    pub bridge_capacity: usize,
    /// How long the poller waits for the bridge to accept an event
    #[serde(default = "default_bridge_timeout")]
    pub bridge_timeout_ms: u64,
    #[serde(default = "default_start_race_timeout")]
    pub start_race_timeout_secs: u64,
    /// Unset means a step waits for its checkpoint indefinitely.
    #[serde(default)]
    pub checkpoint_timeout_secs: Option<u64>,
    /// Delay between records of the simulation backend
    #[serde(default = "default_simulation_interval")]
    pub simulation_interval_ms: u64,
    /// Per-subscriber outbound queue length. Events beyond it are skipped
    /// for that subscriber until it catches up.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_poll_timeout() -> u64 {
    1000
}

fn default_error_backoff() -> u64 {
    500
}

fn default_bridge_capacity() -> usize {
    256
}

fn default_bridge_timeout() -> u64 {
    100
}

fn default_start_race_timeout() -> u64 {
    15
}

fn default_simulation_interval() -> u64 {
    3000
}

fn default_subscriber_buffer() -> usize {
    1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            commit_policy: CommitPolicy::default(),
            checkpoint_source: CheckpointSource::default(),
            poll_timeout_ms: default_poll_timeout(),
            error_backoff_ms: default_error_backoff(),
            bridge_capacity: default_bridge_capacity(),
            bridge_timeout_ms: default_bridge_timeout(),
            start_race_timeout_secs: default_start_race_timeout(),
            checkpoint_timeout_secs: None,
            simulation_interval_ms: default_simulation_interval(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub broker: SanitizedBrokerConfig,
    pub relay: RelayConfig,
}

/// Broker config with credentials hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedBrokerConfig {
    pub backend: String,
    pub bootstrap_servers: String,
    pub security_protocol: String,
    pub credentials_configured: bool,
    pub consumer_group: String,
    pub instruction_topic: String,
    pub checkpoint_topic: String,
    pub partition: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<i64>,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        let broker = &config.broker;
        Self {
            server: config.server.clone(),
            broker: SanitizedBrokerConfig {
                backend: broker.backend.as_str().to_string(),
                bootstrap_servers: broker.bootstrap_servers.clone(),
                security_protocol: broker.security_protocol.as_str().to_string(),
                credentials_configured: broker.sasl_username.is_some()
                    && broker.sasl_password.is_some(),
                consumer_group: broker.consumer_group.clone(),
                instruction_topic: broker.instruction_topic.clone(),
                checkpoint_topic: broker.checkpoint_topic.clone(),
                partition: broker.partition,
                start_offset: broker.start_offset,
            },
            relay: config.relay.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.broker.backend, BrokerBackend::Simulation);
        assert_eq!(config.broker.consumer_group, "pilot");
        assert_eq!(config.relay.commit_policy, CommitPolicy::OnCheckpoint);
        assert_eq!(config.relay.checkpoint_source, CheckpointSource::Auto);
        assert_eq!(config.relay.poll_timeout_ms, 1000);
        assert_eq!(config.relay.bridge_timeout_ms, 100);
        assert_eq!(config.relay.start_race_timeout_secs, 15);
        assert!(config.relay.checkpoint_timeout_secs.is_none());
    }

    #[test]
    fn test_deserialize_kafka_broker() {
        let toml = r#"
[broker]
backend = "kafka"
bootstrap_servers = "broker.local:9092"
security_protocol = "SASL_SSL"
sasl_username = "user"
sasl_password = "secret"
consumer_group = "team-7"
instruction_topic = "team7.instructions"
checkpoint_topic = "team7.checkpoints"
start_offset = 12

[relay]
commit_policy = "immediate"
checkpoint_source = "external"
checkpoint_timeout_secs = 30
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.broker.backend, BrokerBackend::Kafka);
        assert_eq!(config.broker.security_protocol, SecurityProtocol::SaslSsl);
        assert!(config.broker.security_protocol.uses_sasl());
        assert_eq!(config.broker.start_offset, Some(12));
        assert_eq!(config.relay.commit_policy, CommitPolicy::Immediate);
        assert_eq!(config.relay.checkpoint_source, CheckpointSource::External);
        assert_eq!(config.relay.checkpoint_timeout_secs, Some(30));
    }

    #[test]
    fn test_unknown_security_protocol_fails() {
        let toml = r#"
[broker]
security_protocol = "TLS"
"#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_sanitized_config_hides_credentials() {
        let mut config = Config::default();
        config.broker.sasl_username = Some("user".to_string());
        config.broker.sasl_password = Some("hunter2".to_string());

        let sanitized = SanitizedConfig::from(&config);
        assert!(sanitized.broker.credentials_configured);
        assert_eq!(sanitized.broker.backend, "simulation");

        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("sasl_password"));
    }
}
