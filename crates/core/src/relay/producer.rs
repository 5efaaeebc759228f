//! Single-owner producer lane.
//!
//! One worker task owns the [`RecordProducer`] and sends records one at a
//! time, so checkpoints reach the broker in the order they were enqueued.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::run::RunToken;
use crate::broker::{Broker, BrokerError, Delivery, RecordProducer};

struct ProduceJob {
    topic: String,
    key: String,
    payload: Vec<u8>,
    /// Set for records that belong to one consumption run.
    run: Option<RunToken>,
    reply: oneshot::Sender<Result<Delivery, BrokerError>>,
}

/// Handle for enqueueing records. Cheap to clone.
#[derive(Clone)]
pub struct ProducerLane {
    tx: mpsc::UnboundedSender<ProduceJob>,
}

impl ProducerLane {
    /// Enqueue a record without waiting. The returned receiver resolves with
    /// the broker's acknowledgment. Usable from any thread.
    pub fn enqueue(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> oneshot::Receiver<Result<Delivery, BrokerError>> {
        self.push(topic, key, payload, None)
    }

    /// Like [`enqueue`](Self::enqueue), but the record is dropped unsent if
    /// `run` has ended by the time the worker reaches it.
    pub fn enqueue_in_run(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        run: RunToken,
    ) -> oneshot::Receiver<Result<Delivery, BrokerError>> {
        self.push(topic, key, payload, Some(run))
    }

    fn push(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        run: Option<RunToken>,
    ) -> oneshot::Receiver<Result<Delivery, BrokerError>> {
        let (reply, rx) = oneshot::channel();
        let job = ProduceJob {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            run,
            reply,
        };
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            let _ = job.reply.send(Err(BrokerError::Transport(
                "producer worker stopped".to_string(),
            )));
        }
        rx
    }

    /// Enqueue a record and wait for the acknowledgment.
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<Delivery, BrokerError> {
        self.enqueue(topic, key, payload)
            .await
            .unwrap_or_else(|_| Err(BrokerError::Transport("producer worker stopped".to_string())))
    }
}

/// Background task that owns the producer.
pub struct ProducerWorker {
    rx: mpsc::UnboundedReceiver<ProduceJob>,
    broker: Arc<dyn Broker>,
    producer: Option<Arc<dyn RecordProducer>>,
}

impl ProducerWorker {
    /// Run until every [`ProducerLane`] is dropped.
    pub async fn run(mut self) {
        debug!("Producer worker started");
        while let Some(job) = self.rx.recv().await {
            if let Some(run) = job.run.as_ref().filter(|run| !run.is_current()) {
                debug!("Skipping record for {} from ended run {}", job.topic, run.run());
                let _ = job.reply.send(Err(BrokerError::Delivery(format!(
                    "run {} ended before the record was sent",
                    run.run()
                ))));
                continue;
            }
            let result = match self.producer() {
                Ok(producer) => producer.produce(&job.topic, &job.key, &job.payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("Produce to {} failed: {}", job.topic, e);
            }
            // Caller may have given up waiting.
            let _ = job.reply.send(result);
        }
        debug!("Producer worker shutting down");
    }

    /// The producer, opened on first use. A failed open is retried on the
    /// next job.
    fn producer(&mut self) -> Result<Arc<dyn RecordProducer>, BrokerError> {
        if let Some(producer) = &self.producer {
            return Ok(Arc::clone(producer));
        }
        let producer = self.broker.open_producer()?;
        info!("{} producer opened", self.broker.name());
        self.producer = Some(Arc::clone(&producer));
        Ok(producer)
    }
}

/// Create a producer lane and the worker that serves it.
pub fn create_producer_lane(broker: Arc<dyn Broker>) -> (ProducerLane, ProducerWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let lane = ProducerLane { tx };
    let worker = ProducerWorker {
        rx,
        broker,
        producer: None,
    };
    (lane, worker)
}
