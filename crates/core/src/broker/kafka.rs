//! Kafka backend built on librdkafka.

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::types::{
    Assignment, Broker, BrokerError, BrokerMessage, Delivery, MessageHandle, PartitionConsumer,
    PollOutcome, RecordProducer,
};
use crate::config::BrokerConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker talking to a Kafka cluster.
pub struct KafkaBroker {
    config: BrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Settings shared by consumers and producers.
    fn base_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("security.protocol", self.config.security_protocol.as_str());

        if self.config.security_protocol.uses_sasl() {
            client.set("sasl.mechanism", "PLAIN");
            if let Some(username) = &self.config.sasl_username {
                client.set("sasl.username", username);
            }
            if let Some(password) = &self.config.sasl_password {
                client.set("sasl.password", password);
            }
        }
        client
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut client = self.base_config();
        client
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("fetch.min.bytes", "1");
        client
    }

    fn producer_config(&self) -> ClientConfig {
        let timeout_ms = self.config.produce_timeout_secs * 1000;
        let mut client = self.base_config();
        client
            .set("client.id", &self.config.producer_client_id)
            .set("acks", "all")
            .set("retries", self.config.producer_retries.to_string())
            .set("retry.backoff.ms", "300")
            .set("linger.ms", "10")
            .set("batch.size", "16384")
            .set("compression.type", "snappy")
            .set("message.timeout.ms", timeout_ms.to_string());
        client
    }

    fn first_bootstrap(&self) -> Option<&str> {
        self.config
            .bootstrap_servers
            .split(',')
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn ping(&self) -> Result<String, BrokerError> {
        let address = self
            .first_bootstrap()
            .ok_or_else(|| BrokerError::Config("no bootstrap server configured".to_string()))?;

        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(_)) => Ok(format!("TCP connection to {} succeeded", address)),
            Ok(Err(e)) => Err(BrokerError::Unreachable(format!("{}: {}", address, e))),
            Err(_) => Err(BrokerError::Unreachable(format!(
                "{}: connection timed out after {}s",
                address,
                CONNECT_TIMEOUT.as_secs()
            ))),
        }
    }

    fn open_consumer(
        &self,
        assignment: &Assignment,
    ) -> Result<Box<dyn PartitionConsumer>, BrokerError> {
        let consumer: BaseConsumer = self
            .consumer_config(&assignment.group)
            .create()
            .map_err(map_error)?;

        let offset = match assignment.start_offset {
            Some(offset) => Offset::Offset(offset),
            None => Offset::Stored,
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&assignment.topic, assignment.partition, offset)
            .map_err(map_error)?;
        consumer.assign(&tpl).map_err(map_error)?;

        info!(
            topic = %assignment.topic,
            partition = assignment.partition,
            group = %assignment.group,
            offset = ?offset,
            "Kafka consumer assigned"
        );

        Ok(Box::new(KafkaConsumer {
            consumer: Some(consumer),
        }))
    }

    fn open_producer(&self) -> Result<Arc<dyn RecordProducer>, BrokerError> {
        let producer: FutureProducer = self.producer_config().create().map_err(map_error)?;
        Ok(Arc::new(KafkaProducer {
            producer,
            queue_timeout: Duration::from_secs(self.config.produce_timeout_secs),
        }))
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        let client = self.consumer_config(&format!("{}-metadata", self.config.consumer_group));
        let topic = topic.to_string();

        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = client.create().map_err(map_error)?;
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(map_error)?;
            Ok(metadata
                .topics()
                .iter()
                .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty()))
        })
        .await
        .map_err(|e| BrokerError::Transport(format!("metadata task failed: {}", e)))?
    }
}

struct KafkaConsumer {
    consumer: Option<BaseConsumer>,
}

impl PartitionConsumer for KafkaConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| BrokerError::Fatal("consumer closed".to_string()))?;

        match consumer.poll(timeout) {
            None => Ok(PollOutcome::Empty),
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                debug!(partition, "Reached end of partition");
                Ok(PollOutcome::PartitionEof)
            }
            Some(Err(e)) => Err(map_error(e)),
            Some(Ok(message)) => Ok(PollOutcome::Message(BrokerMessage {
                handle: MessageHandle {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                },
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
        }
    }

    fn commit(&mut self, handle: &MessageHandle) -> Result<(), BrokerError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| BrokerError::Commit("consumer closed".to_string()))?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &handle.topic,
            handle.partition,
            Offset::Offset(handle.offset + 1),
        )
        .map_err(|e| BrokerError::Commit(e.to_string()))?;
        consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.unassign() {
                warn!(error = %e, "Failed to unassign Kafka consumer");
            }
            info!("Kafka consumer closed");
        }
    }
}

struct KafkaProducer {
    producer: FutureProducer,
    queue_timeout: Duration,
}

#[async_trait]
impl RecordProducer for KafkaProducer {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        match self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(Delivery {
                topic: topic.to_string(),
                partition,
                offset,
            }),
            Err((e, _)) => Err(BrokerError::Delivery(e.to_string())),
        }
    }
}

fn map_error(error: KafkaError) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::Fatal) => BrokerError::Fatal(error.to_string()),
        Some(RDKafkaErrorCode::AllBrokersDown) => BrokerError::Unreachable(error.to_string()),
        _ => match error {
            KafkaError::ClientCreation(msg) => BrokerError::Config(msg),
            other => BrokerError::Transport(other.to_string()),
        },
    }
}
