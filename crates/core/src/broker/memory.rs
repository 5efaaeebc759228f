//! In-process broker backed by per-partition logs.
//!
//! Serves two purposes: the `simulation` backend (a bounded, paced demo
//! route) and a controllable test double for the relay engine.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::types::{
    Assignment, Broker, BrokerError, BrokerMessage, Delivery, MessageHandle, PartitionConsumer,
    PollOutcome, RecordProducer,
};
use crate::config::BrokerConfig;
use crate::messages::Instruction;

/// A record produced through a [`MemoryBroker`] producer.
#[derive(Debug, Clone)]
pub struct ProducedRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub offset: i64,
}

impl ProducedRecord {
    /// Payload parsed as JSON, `Null` if it is not valid JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    topics: HashSet<String>,
    logs: HashMap<(String, i32), Vec<StoredRecord>>,
    /// Next offset to read, keyed by (group, topic, partition).
    committed: HashMap<(String, String, i32), i64>,
    commit_log: Vec<MessageHandle>,
    produced: Vec<ProducedRecord>,
    unreachable: bool,
    fail_commits: bool,
    fail_produce: bool,
    produce_delay: Option<Duration>,
    poll_errors: VecDeque<BrokerError>,
    consumers_opened: usize,
    consumers_closed: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    appended: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`Broker`] implementation.
///
/// Provides controllable behavior for testing:
/// - Append raw or JSON records to any topic-partition
/// - Inspect committed offsets, the commit log and produced records
/// - Simulate an unreachable broker, slow producers, failing commits
///   and transient poll errors
///
/// # Example
///
/// ```rust,ignore
/// let broker = MemoryBroker::new();
/// broker.append_json("training_instructions", 0, &instruction);
///
/// // ... run the relay ...
///
/// assert_eq!(broker.committed_offset("pilot", "training_instructions", 0), Some(1));
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
    name: &'static str,
    /// Report `Exhausted` once the log is fully read.
    bounded: bool,
    /// Minimum spacing between delivered records.
    pacing: Option<Duration>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, unbounded broker.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            name: "memory",
            bounded: false,
            pacing: None,
        }
    }

    /// Create the simulation backend: the demo route preloaded on the
    /// instruction topic, delivered one record per `interval`, ending the
    /// race once the route is exhausted.
    pub fn simulation(config: &BrokerConfig, interval: Duration) -> Self {
        let broker = Self {
            name: "simulation",
            bounded: true,
            pacing: Some(interval),
            ..Self::new()
        };
        broker.create_topic(&config.checkpoint_topic);
        for instruction in demo_route() {
            broker.append_json(&config.instruction_topic, config.partition, &instruction);
        }
        broker
    }

    /// Report `Exhausted` instead of `PartitionEof` at the end of the log.
    pub fn bounded(mut self, bounded: bool) -> Self {
        self.bounded = bounded;
        self
    }

    /// Space delivered records at least `interval` apart.
    pub fn with_pacing(mut self, interval: Duration) -> Self {
        self.pacing = Some(interval);
        self
    }

    /// Register a topic without records.
    pub fn create_topic(&self, topic: &str) {
        self.shared.lock().topics.insert(topic.to_string());
    }

    /// Append a raw record and return its offset.
    pub fn append(&self, topic: &str, partition: i32, key: Option<&str>, payload: &[u8]) -> i64 {
        let offset = {
            let mut state = self.shared.lock();
            state.topics.insert(topic.to_string());
            let log = state
                .logs
                .entry((topic.to_string(), partition))
                .or_default();
            log.push(StoredRecord {
                key: key.map(|k| k.as_bytes().to_vec()),
                payload: payload.to_vec(),
            });
            (log.len() - 1) as i64
        };
        self.shared.appended.notify_all();
        offset
    }

    /// Append a JSON-serialized record and return its offset.
    pub fn append_json<T: serde::Serialize>(&self, topic: &str, partition: i32, value: &T) -> i64 {
        let payload = serde_json::to_vec(value).unwrap_or_default();
        self.append(topic, partition, None, &payload)
    }

    /// Number of records in a topic-partition.
    pub fn log_len(&self, topic: &str, partition: i32) -> usize {
        self.shared
            .lock()
            .logs
            .get(&(topic.to_string(), partition))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Make every subsequent operation fail as if the broker were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.lock().unreachable = unreachable;
    }

    /// Delay every produce by `delay` before acknowledging.
    pub fn set_produce_delay(&self, delay: Option<Duration>) {
        self.shared.lock().produce_delay = delay;
    }

    /// Make commits fail.
    pub fn set_fail_commits(&self, fail: bool) {
        self.shared.lock().fail_commits = fail;
    }

    /// Make produces fail with a delivery error.
    pub fn set_fail_produce(&self, fail: bool) {
        self.shared.lock().fail_produce = fail;
    }

    /// Queue an error to be returned by the next poll.
    pub fn inject_poll_error(&self, error: BrokerError) {
        self.shared.lock().poll_errors.push_back(error);
    }

    /// Committed position (next offset to read) for a group.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Pre-set a committed position, as if a previous run had committed it.
    pub fn set_committed_offset(&self, group: &str, topic: &str, partition: i32, next: i64) {
        self.shared
            .lock()
            .committed
            .insert((group.to_string(), topic.to_string(), partition), next);
    }

    /// Every handle committed so far, in commit order.
    pub fn commit_log(&self) -> Vec<MessageHandle> {
        self.shared.lock().commit_log.clone()
    }

    /// Records produced to `topic`, in acknowledgment order.
    pub fn produced(&self, topic: &str) -> Vec<ProducedRecord> {
        self.shared
            .lock()
            .produced
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of consumers opened so far.
    pub fn consumers_opened(&self) -> usize {
        self.shared.lock().consumers_opened
    }

    /// Number of consumers closed so far.
    pub fn consumers_closed(&self) -> usize {
        self.shared.lock().consumers_closed
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn ping(&self) -> Result<String, BrokerError> {
        if self.shared.lock().unreachable {
            return Err(BrokerError::Unreachable(
                "in-process broker marked unreachable".to_string(),
            ));
        }
        Ok(format!("{} broker available in-process", self.name))
    }

    fn open_consumer(
        &self,
        assignment: &Assignment,
    ) -> Result<Box<dyn PartitionConsumer>, BrokerError> {
        let mut state = self.shared.lock();
        if state.unreachable {
            return Err(BrokerError::Unreachable(
                "in-process broker marked unreachable".to_string(),
            ));
        }
        let position = assignment.start_offset.unwrap_or_else(|| {
            state
                .committed
                .get(&(
                    assignment.group.clone(),
                    assignment.topic.clone(),
                    assignment.partition,
                ))
                .copied()
                .unwrap_or(0)
        });
        state.consumers_opened += 1;

        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            assignment: assignment.clone(),
            position,
            eof_reported: false,
            bounded: self.bounded,
            pacing: self.pacing,
            next_ready_at: None,
            closed: false,
        }))
    }

    fn open_producer(&self) -> Result<Arc<dyn RecordProducer>, BrokerError> {
        if self.shared.lock().unreachable {
            return Err(BrokerError::Unreachable(
                "in-process broker marked unreachable".to_string(),
            ));
        }
        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        let state = self.shared.lock();
        if state.unreachable {
            return Err(BrokerError::Unreachable(
                "in-process broker marked unreachable".to_string(),
            ));
        }
        Ok(state.topics.contains(topic))
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    assignment: Assignment,
    position: i64,
    eof_reported: bool,
    bounded: bool,
    pacing: Option<Duration>,
    next_ready_at: Option<Instant>,
    closed: bool,
}

impl MemoryConsumer {
    fn key(&self) -> (String, i32) {
        (self.assignment.topic.clone(), self.assignment.partition)
    }

    fn take_record(&mut self, state: &MemoryState) -> Option<BrokerMessage> {
        let record = state
            .logs
            .get(&self.key())?
            .get(usize::try_from(self.position).ok()?)?
            .clone();
        let handle = MessageHandle {
            topic: self.assignment.topic.clone(),
            partition: self.assignment.partition,
            offset: self.position,
        };
        self.position += 1;
        self.eof_reported = false;
        self.next_ready_at = self.pacing.map(|p| Instant::now() + p);
        Some(BrokerMessage {
            handle,
            key: record.key,
            payload: record.payload,
        })
    }

    fn has_record(&self, state: &MemoryState) -> bool {
        state
            .logs
            .get(&self.key())
            .map(|log| (log.len() as i64) > self.position)
            .unwrap_or(false)
    }
}

impl PartitionConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError> {
        if self.closed {
            return Err(BrokerError::Fatal("consumer closed".to_string()));
        }

        // Honor pacing before touching the log.
        if let Some(ready_at) = self.next_ready_at {
            let now = Instant::now();
            if ready_at > now {
                let wait = ready_at - now;
                std::thread::sleep(wait.min(timeout));
                if wait > timeout {
                    return Ok(PollOutcome::Empty);
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        if state.unreachable {
            return Err(BrokerError::Transport("broker unreachable".to_string()));
        }
        if let Some(error) = state.poll_errors.pop_front() {
            return Err(error);
        }

        if let Some(message) = self.take_record(&state) {
            return Ok(PollOutcome::Message(message));
        }

        if self.bounded {
            return Ok(PollOutcome::Exhausted);
        }
        if !self.eof_reported {
            self.eof_reported = true;
            return Ok(PollOutcome::PartitionEof);
        }

        let (guard, _) = shared
            .appended
            .wait_timeout_while(state, timeout, |s| !self.has_record(s))
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;

        match self.take_record(&state) {
            Some(message) => Ok(PollOutcome::Message(message)),
            None => Ok(PollOutcome::Empty),
        }
    }

    fn commit(&mut self, handle: &MessageHandle) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        if state.unreachable {
            return Err(BrokerError::Commit("broker unreachable".to_string()));
        }
        if state.fail_commits {
            return Err(BrokerError::Commit(format!(
                "commit of offset {} rejected",
                handle.offset
            )));
        }
        state.committed.insert(
            (
                self.assignment.group.clone(),
                handle.topic.clone(),
                handle.partition,
            ),
            handle.offset + 1,
        );
        state.commit_log.push(handle.clone());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.lock().consumers_closed += 1;
        }
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
}

#[async_trait]
impl RecordProducer for MemoryProducer {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, BrokerError> {
        let delay = self.shared.lock().produce_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let offset = {
            let mut state = self.shared.lock();
            if state.unreachable {
                return Err(BrokerError::Unreachable("broker unreachable".to_string()));
            }
            if state.fail_produce {
                return Err(BrokerError::Delivery(format!("delivery to {} failed", topic)));
            }
            state.topics.insert(topic.to_string());
            let log = state.logs.entry((topic.to_string(), 0)).or_default();
            log.push(StoredRecord {
                key: Some(key.as_bytes().to_vec()),
                payload: payload.to_vec(),
            });
            let offset = (log.len() - 1) as i64;
            state.produced.push(ProducedRecord {
                topic: topic.to_string(),
                key: key.to_string(),
                payload: payload.to_vec(),
                offset,
            });
            offset
        };
        self.shared.appended.notify_all();

        Ok(Delivery {
            topic: topic.to_string(),
            partition: 0,
            offset,
        })
    }
}

/// The demo route served by the simulation backend.
pub fn demo_route() -> Vec<Instruction> {
    [
        ("1", "start", "Départ - Place Grenette", 0.0, 45.1885, 5.7245),
        ("2", "go_forward", "Rue de la République", 0.2, 45.1895, 5.7255),
        ("3", "turn_right", "Boulevard Edouard Rey", 0.15, 45.1905, 5.7265),
        ("4", "go_forward", "Avenue Alsace Lorraine", 0.3, 45.1920, 5.7280),
        ("5", "turn_left", "Campus ENSIMAG", 0.25, 45.1935, 5.7295),
        ("6", "arrival", "Arrivée - ENSIMAG", 0.1, 45.1945, 5.7305),
    ]
    .into_iter()
    .map(|(id, action, target, km_gain, lat, lon)| Instruction {
        id: id.to_string(),
        kind: "instruction".to_string(),
        action: action.to_string(),
        target: target.to_string(),
        km_gain,
        latitude: Some(lat),
        longitude: Some(lon),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(start_offset: Option<i64>) -> Assignment {
        Assignment {
            topic: "instructions".to_string(),
            partition: 0,
            group: "pilot".to_string(),
            start_offset,
        }
    }

    fn expect_message(outcome: PollOutcome) -> BrokerMessage {
        match outcome {
            PollOutcome::Message(m) => m,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_reads_in_order_then_eof_then_empty() {
        let broker = MemoryBroker::new();
        broker.append("instructions", 0, None, b"a");
        broker.append("instructions", 0, None, b"b");

        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        let timeout = Duration::from_millis(10);

        assert_eq!(expect_message(consumer.poll(timeout).unwrap()).payload, b"a");
        assert_eq!(expect_message(consumer.poll(timeout).unwrap()).payload, b"b");
        assert!(matches!(
            consumer.poll(timeout).unwrap(),
            PollOutcome::PartitionEof
        ));
        assert!(matches!(consumer.poll(timeout).unwrap(), PollOutcome::Empty));
    }

    #[test]
    fn test_resumes_from_committed_offset() {
        let broker = MemoryBroker::new();
        for payload in [b"a", b"b", b"c"] {
            broker.append("instructions", 0, None, payload);
        }

        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        let first = expect_message(consumer.poll(Duration::from_millis(10)).unwrap());
        consumer.commit(&first.handle).unwrap();
        consumer.close();

        assert_eq!(broker.committed_offset("pilot", "instructions", 0), Some(1));

        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        let next = expect_message(consumer.poll(Duration::from_millis(10)).unwrap());
        assert_eq!(next.handle.offset, 1);
        assert_eq!(next.payload, b"b");
    }

    #[test]
    fn test_explicit_start_offset_wins() {
        let broker = MemoryBroker::new();
        for payload in [b"a", b"b", b"c"] {
            broker.append("instructions", 0, None, payload);
        }
        broker.set_committed_offset("pilot", "instructions", 0, 1);

        let mut consumer = broker.open_consumer(&assignment(Some(2))).unwrap();
        let message = expect_message(consumer.poll(Duration::from_millis(10)).unwrap());
        assert_eq!(message.handle.offset, 2);
    }

    #[test]
    fn test_bounded_reports_exhausted() {
        let broker = MemoryBroker::new().bounded(true);
        broker.append("instructions", 0, None, b"a");

        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        expect_message(consumer.poll(Duration::from_millis(10)).unwrap());
        assert!(matches!(
            consumer.poll(Duration::from_millis(10)).unwrap(),
            PollOutcome::Exhausted
        ));
    }

    #[test]
    fn test_poll_wakes_on_append() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        assert!(matches!(
            consumer.poll(Duration::from_millis(1)).unwrap(),
            PollOutcome::PartitionEof
        ));

        let writer = broker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.append("instructions", 0, None, b"late");
        });

        let message = expect_message(consumer.poll(Duration::from_secs(5)).unwrap());
        assert_eq!(message.payload, b"late");
        handle.join().unwrap();
    }

    #[test]
    fn test_injected_poll_error_is_returned_once() {
        let broker = MemoryBroker::new();
        broker.append("instructions", 0, None, b"a");
        broker.inject_poll_error(BrokerError::Transport("blip".to_string()));

        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        assert!(consumer.poll(Duration::from_millis(10)).is_err());
        expect_message(consumer.poll(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_failing_commits() {
        let broker = MemoryBroker::new();
        broker.append("instructions", 0, None, b"a");
        broker.set_fail_commits(true);

        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        let message = expect_message(consumer.poll(Duration::from_millis(10)).unwrap());
        assert!(matches!(
            consumer.commit(&message.handle),
            Err(BrokerError::Commit(_))
        ));
        assert_eq!(broker.committed_offset("pilot", "instructions", 0), None);
    }

    #[test]
    fn test_close_is_counted_once() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.open_consumer(&assignment(None)).unwrap();
        consumer.close();
        consumer.close();
        assert_eq!(broker.consumers_opened(), 1);
        assert_eq!(broker.consumers_closed(), 1);
    }

    #[test]
    fn test_unreachable_rejects_consumer() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        assert!(matches!(
            broker.open_consumer(&assignment(None)),
            Err(BrokerError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_produce_records_and_creates_topic() {
        let broker = MemoryBroker::new();
        let producer = broker.open_producer().unwrap();

        let delivery = producer
            .produce("checkpoints", "pilot", br#"{"step":"1"}"#)
            .await
            .unwrap();
        assert_eq!(delivery.offset, 0);

        let produced = broker.produced("checkpoints");
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].key, "pilot");
        assert_eq!(produced[0].json()["step"], "1");
        assert!(broker.topic_exists("checkpoints").await.unwrap());
        assert!(!broker.topic_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_simulation_preloads_demo_route() {
        let config = BrokerConfig::default();
        let broker = MemoryBroker::simulation(&config, Duration::from_millis(1));

        assert_eq!(broker.name(), "simulation");
        assert_eq!(broker.log_len(&config.instruction_topic, config.partition), 6);
        assert!(broker.topic_exists(&config.checkpoint_topic).await.unwrap());
    }

    #[test]
    fn test_demo_route_mileage() {
        let route = demo_route();
        assert_eq!(route.len(), 6);
        assert_eq!(route[0].action, "start");
        assert_eq!(route[5].action, "arrival");
        let total: f64 = route.iter().map(|i| i.km_gain).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
