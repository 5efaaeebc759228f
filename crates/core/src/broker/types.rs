//! Types for broker operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Fatal consumer error: {0}")]
    Fatal(String),

    #[error("Broker configuration error: {0}")]
    Config(String),

    #[error("Request timeout")]
    Timeout,
}

impl BrokerError {
    /// Fatal errors end the poll loop; everything else is retried after a backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_) | BrokerError::Config(_))
    }
}

/// Manual assignment of one topic-partition to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub topic: String,
    pub partition: i32,
    /// Consumer group that owns the committed offsets.
    pub group: String,
    /// Explicit start offset; `None` resumes from the last committed offset.
    pub start_offset: Option<i64>,
}

/// Opaque token identifying a consumed record for commit purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A record read from the assigned partition.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub handle: MessageHandle,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Result of a single poll.
#[derive(Debug)]
pub enum PollOutcome {
    Message(BrokerMessage),
    /// Nothing arrived within the timeout.
    Empty,
    /// Reached the current end of the partition; more may arrive later.
    PartitionEof,
    /// The source is bounded and fully consumed.
    Exhausted,
}

/// Acknowledged delivery of a produced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Blocking consumer bound to a single topic-partition.
///
/// Owned by exactly one poller thread; never shared.
pub trait PartitionConsumer: Send {
    /// Wait up to `timeout` for the next record.
    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError>;

    /// Synchronously commit the position after `handle`.
    fn commit(&mut self, handle: &MessageHandle) -> Result<(), BrokerError>;

    /// Release the underlying client. Must be idempotent.
    fn close(&mut self);
}

/// Producer for the checkpoint topic.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Produce a record and wait for the broker's acknowledgment.
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, BrokerError>;
}

/// Factory for consumers and producers plus cluster metadata.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend name for logs and the status surface.
    fn name(&self) -> &'static str;

    /// Check that the broker can be reached at the transport level.
    ///
    /// Returns a short human-readable description of what was reached.
    async fn ping(&self) -> Result<String, BrokerError>;

    /// Open a consumer with a manual partition assignment. Blocking.
    fn open_consumer(
        &self,
        assignment: &Assignment,
    ) -> Result<Box<dyn PartitionConsumer>, BrokerError>;

    /// Open a producer.
    fn open_producer(&self) -> Result<Arc<dyn RecordProducer>, BrokerError>;

    /// Fetch cluster metadata and report whether `topic` exists.
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError>;
}

/// Closes the wrapped consumer when dropped, including on unwind.
pub struct ConsumerGuard {
    inner: Box<dyn PartitionConsumer>,
}

impl ConsumerGuard {
    pub fn new(inner: Box<dyn PartitionConsumer>) -> Self {
        Self { inner }
    }
}

impl Deref for ConsumerGuard {
    type Target = dyn PartitionConsumer;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for ConsumerGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.inner.close();
    }
}
