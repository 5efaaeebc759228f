use super::{
    types::{BrokerBackend, Config},
    ConfigError,
};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    let broker = &config.broker;
    if broker.instruction_topic.trim().is_empty() {
        return Err(invalid("broker.instruction_topic cannot be empty"));
    }
    if broker.checkpoint_topic.trim().is_empty() {
        return Err(invalid("broker.checkpoint_topic cannot be empty"));
    }
    if broker.consumer_group.trim().is_empty() {
        return Err(invalid("broker.consumer_group cannot be empty"));
    }
    if broker.partition < 0 {
        return Err(invalid("broker.partition cannot be negative"));
    }
    if matches!(broker.start_offset, Some(offset) if offset < 0) {
        return Err(invalid("broker.start_offset cannot be negative"));
    }

    if broker.backend == BrokerBackend::Kafka {
        if !cfg!(feature = "kafka") {
            return Err(invalid(
                "broker.backend = \"kafka\" requires building with the `kafka` feature",
            ));
        }
        validate_bootstrap(&broker.bootstrap_servers)?;
        if broker.security_protocol.uses_sasl()
            && (is_blank(&broker.sasl_username) || is_blank(&broker.sasl_password))
        {
            return Err(invalid(&format!(
                "security_protocol {} requires sasl_username and sasl_password",
                broker.security_protocol.as_str()
            )));
        }
        if broker.security_protocol.uses_tls() && !cfg!(feature = "kafka-ssl") {
            return Err(invalid(&format!(
                "security_protocol {} requires building with the `kafka-ssl` feature",
                broker.security_protocol.as_str()
            )));
        }
    }

    let relay = &config.relay;
    if relay.poll_timeout_ms == 0 {
        return Err(invalid("relay.poll_timeout_ms cannot be 0"));
    }
    if relay.bridge_capacity == 0 {
        return Err(invalid("relay.bridge_capacity cannot be 0"));
    }
    if relay.subscriber_buffer == 0 {
        return Err(invalid("relay.subscriber_buffer cannot be 0"));
    }
    if relay.start_race_timeout_secs == 0 {
        return Err(invalid("relay.start_race_timeout_secs cannot be 0"));
    }
    if relay.checkpoint_timeout_secs == Some(0) {
        return Err(invalid(
            "relay.checkpoint_timeout_secs cannot be 0 (leave unset to wait indefinitely)",
        ));
    }

    Ok(())
}

/// Every comma-separated entry must look like `host:port`.
fn validate_bootstrap(servers: &str) -> Result<(), ConfigError> {
    if servers.trim().is_empty() {
        return Err(invalid("broker.bootstrap_servers is required for the kafka backend"));
    }
    for entry in servers.split(',') {
        let entry = entry.trim();
        let valid = entry
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(invalid(&format!(
                "broker.bootstrap_servers entry '{}' is not host:port",
                entry
            )));
        }
    }
    Ok(())
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SecurityProtocol, ServerConfig};

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".parse().unwrap(),
                port: 0,
            },
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_empty_topic_fails() {
        let mut config = Config::default();
        config.broker.checkpoint_topic = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_bridge_capacity_fails() {
        let mut config = Config::default();
        config.relay.bridge_capacity = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_checkpoint_timeout_fails() {
        let mut config = Config::default();
        config.relay.checkpoint_timeout_secs = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_bootstrap_format() {
        assert!(validate_bootstrap("localhost:9092").is_ok());
        assert!(validate_bootstrap("a:9092, b:9093").is_ok());
        assert!(validate_bootstrap("localhost").is_err());
        assert!(validate_bootstrap(":9092").is_err());
        assert!(validate_bootstrap("host:notaport").is_err());
        assert!(validate_bootstrap("").is_err());
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn test_validate_sasl_requires_credentials() {
        let mut config = Config::default();
        config.broker.backend = BrokerBackend::Kafka;
        config.broker.bootstrap_servers = "localhost:9092".to_string();
        config.broker.security_protocol = SecurityProtocol::SaslPlaintext;
        assert!(validate_config(&config).is_err());

        config.broker.sasl_username = Some("user".to_string());
        config.broker.sasl_password = Some("pass".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[cfg(all(feature = "kafka", not(feature = "kafka-ssl")))]
    #[test]
    fn test_validate_tls_without_ssl_feature_fails() {
        let mut config = Config::default();
        config.broker.backend = BrokerBackend::Kafka;
        config.broker.bootstrap_servers = "localhost:9092".to_string();
        config.broker.security_protocol = SecurityProtocol::Ssl;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("kafka-ssl"));
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn test_validate_kafka_without_feature_fails() {
        let mut config = Config::default();
        config.broker.backend = BrokerBackend::Kafka;
        config.broker.bootstrap_servers = "localhost:9092".to_string();
        config.broker.security_protocol = SecurityProtocol::Plaintext;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("kafka"));
    }
}
