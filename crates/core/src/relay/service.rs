//! The relay service object.
//!
//! Owns every piece of mutable relay state (status, mileage, journal,
//! checkpoint registries, subscribers) and exposes the operator operations.
//! Background work runs in [`RelayWorkers`] and the poller thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bridge::{create_bridge, Bridge, Dispatcher, EventHandler, RelayEvent};
use super::checkpoint::{CheckpointError, CheckpointRegistry};
use super::fanout::{Hub, RelayMessage};
use super::poller::{spawn_poller, PollerHandle};
use super::producer::{create_producer_lane, ProducerLane, ProducerWorker};
use super::run::RunCounter;
use super::status::{ServiceStatus, StatusError, StatusMachine};
use super::types::{
    relay_line, ActionResponse, ConnectivityReport, ConnectivityStage, RelayError, RelayStats,
};
use crate::broker::{Assignment, Broker, BrokerError, Delivery};
use crate::config::{CheckpointSource, CommitPolicy, Config};
use crate::messages::{validate_checkpoint, Checkpoint, Instruction, Ready};
use crate::metrics;

const READY_MESSAGE: &str = "Pilot ready to start driving";

#[derive(Debug, Default)]
struct Journal {
    instructions: Vec<Instruction>,
    /// Index of the next instruction served by `next_instruction`.
    cursor: usize,
}

/// State shared by the service handle, the poller thread and the workers.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) registry: CheckpointRegistry,
    pub(crate) bridge: Bridge,
    status: Arc<StatusMachine>,
    mileage: Mutex<f64>,
    journal: Mutex<Journal>,
    hub: Hub,
    producer: ProducerLane,
    delivered: AtomicU64,
    runs: RunCounter,
    poller: Mutex<Option<PollerHandle>>,
    runtime: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn assignment(&self) -> Assignment {
        Assignment {
            topic: self.config.broker.instruction_topic.clone(),
            partition: self.config.broker.partition,
            group: self.config.broker.consumer_group.clone(),
            start_offset: self.config.broker.start_offset,
        }
    }

    /// Emit an operator-facing log line.
    pub(crate) fn log(&self, message: &str) {
        info!("{}", message);
        self.bridge.submit(RelayEvent::Log(relay_line(message)));
    }

    pub(crate) fn log_warning(&self, message: &str) {
        warn!("{}", message);
        self.bridge.submit(RelayEvent::Log(relay_line(message)));
    }

    pub(crate) fn log_error(&self, message: &str) {
        error!("{}", message);
        self.bridge.submit(RelayEvent::Log(relay_line(message)));
    }

    /// Transition the status machine, then log and publish the change.
    pub(crate) fn set_status(&self, to: ServiceStatus) -> Result<(), StatusError> {
        if self.status.transition(to)?.is_some() {
            self.status_changed(to);
        }
        Ok(())
    }

    fn status_changed(&self, to: ServiceStatus) {
        self.log(&format!("Status updated: {}", to));
        self.bridge.submit(RelayEvent::Status(self.stats()));
    }

    /// Account for a consumed instruction. Returns the mileage after it.
    pub(crate) fn record_instruction(&self, instruction: &Instruction) -> f64 {
        let km = {
            let mut mileage = lock(&self.mileage);
            *mileage += instruction.km_gain;
            *mileage
        };
        lock(&self.journal).instructions.push(instruction.clone());
        km
    }

    pub(crate) fn stats(&self) -> RelayStats {
        RelayStats {
            status: self.status.current(),
            ready_sent: self.status.ready_sent(),
            consuming: self.is_consuming(),
            total_km_travelled: *lock(&self.mileage),
            instructions_processed: lock(&self.journal).instructions.len(),
            instructions_delivered: self.delivered.load(Ordering::Relaxed),
            pending_checkpoints: self.registry.pending_count(),
            subscribers: self.hub.len(),
        }
    }

    fn is_consuming(&self) -> bool {
        lock(&self.poller)
            .as_ref()
            .map(|p| !p.is_finished())
            .unwrap_or(false)
    }

    fn fan_out_instruction(&self, instruction: Instruction) {
        self.hub
            .broadcast(&RelayMessage::Instruction { data: instruction });
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Release the step's signal and enqueue its checkpoint. The
    /// acknowledgment is awaited on the runtime.
    fn produce_checkpoint(self: &Arc<Self>, step: &str, km_travelled: f64, run: u64) {
        if self.config.relay.commit_policy == CommitPolicy::OnCheckpoint {
            self.registry.deliver_checkpoint(step);
        }

        let group = &self.config.broker.consumer_group;
        let checkpoint = Checkpoint::new(step, step, group, km_travelled);
        let payload = match serde_json::to_vec(&checkpoint) {
            Ok(payload) => payload,
            Err(e) => {
                self.log_error(&format!("❌ Failed to encode checkpoint {}: {}", step, e));
                return;
            }
        };
        let ack = self.producer.enqueue_in_run(
            &self.config.broker.checkpoint_topic,
            group,
            payload,
            self.runs.token(run),
        );

        let shared = Arc::clone(self);
        let step = step.to_string();
        self.runtime.spawn(async move {
            let result = ack.await.unwrap_or_else(|_| {
                Err(BrokerError::Transport(
                    "producer worker stopped".to_string(),
                ))
            });
            if !shared.runs.is_current(run) {
                debug!("Checkpoint {} belongs to ended run {}", step, run);
                return;
            }
            shared.checkpoint_sent(&step, result);
        });
    }

    fn checkpoint_sent(&self, step: &str, result: Result<Delivery, BrokerError>) {
        match result {
            Ok(delivery) => {
                metrics::CHECKPOINTS_PRODUCED
                    .with_label_values(&["ok"])
                    .inc();
                self.log(&format!(
                    "📤 Checkpoint {} sent to {} (offset {})",
                    step, delivery.topic, delivery.offset
                ));
            }
            Err(e) => {
                metrics::CHECKPOINTS_PRODUCED
                    .with_label_values(&["error"])
                    .inc();
                self.log_warning(&format!("❌ Checkpoint {} not delivered: {}", step, e));
            }
        }
    }

    /// Wait for the step's checkpoint and commit its offset.
    async fn settle_checkpoint(self: Arc<Self>, step: String) {
        let timeout = self
            .config
            .relay
            .checkpoint_timeout_secs
            .map(Duration::from_secs);

        match self.registry.await_checkpoint(&step, timeout).await {
            Ok(offset) => {
                self.log(&format!("✅ Offset {} committed for step {}", offset, step));
            }
            Err(CheckpointError::Cancelled) => {
                debug!("Wait for step {} cancelled by reset", step);
            }
            Err(e) => {
                self.log_warning(&format!("⚠️ Step {} left uncommitted: {}", step, e));
            }
        }
    }

    /// End the consumption run: stop and join the poller, then drop state
    /// tied to the run. Events the run already queued are discarded.
    async fn halt(&self) {
        let run = self.runs.advance();
        debug!("Starting consumption run {}", run);
        let handle = lock(&self.poller).take();
        if let Some(handle) = handle {
            handle.signal_stop();
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => debug!("Poller joined"),
                Ok(Err(_)) => error!("Poller thread panicked"),
                Err(e) => error!("Failed to join poller: {}", e),
            }
        }
        self.registry.clear();
        *lock(&self.mileage) = 0.0;
    }
}

/// Routes bridge events onto the relay's state.
struct RelayEvents {
    shared: Weak<Shared>,
}

impl EventHandler for RelayEvents {
    fn handle(&self, event: RelayEvent) {
        let Some(shared) = self.shared.upgrade() else {
            debug!("Relay dropped, discarding bridge event");
            return;
        };

        if let Some(run) = event.run() {
            if !shared.runs.is_current(run) {
                debug!("Discarding {} from ended run {}", event.kind(), run);
                return;
            }
        }

        match event {
            RelayEvent::Instruction { instruction, .. } => shared.fan_out_instruction(instruction),
            RelayEvent::AwaitCheckpoint { step, .. } => {
                let runtime = shared.runtime.clone();
                runtime.spawn(shared.settle_checkpoint(step));
            }
            RelayEvent::ProduceCheckpoint {
                step,
                km_travelled,
                run,
            } => {
                shared.produce_checkpoint(&step, km_travelled, run);
            }
            RelayEvent::Log(line) => {
                shared.hub.broadcast(&RelayMessage::Log { message: line });
            }
            RelayEvent::Status(stats) => {
                shared.hub.broadcast(&RelayMessage::Status { data: stats });
            }
        }
    }
}

/// Background tasks of a relay service.
///
/// Spawn with `tokio::spawn(workers.run())`.
pub struct RelayWorkers {
    dispatcher: Dispatcher,
    producer: ProducerWorker,
}

impl RelayWorkers {
    /// Run the bridge dispatcher and the producer worker until the service
    /// is dropped.
    pub async fn run(self) {
        tokio::join!(self.dispatcher.run(), self.producer.run());
    }
}

/// Handle to the relay. Cheap to clone.
#[derive(Clone)]
pub struct RelayService {
    shared: Arc<Shared>,
}

/// Create a relay service and its background workers.
///
/// Must be called from within a Tokio runtime; the runtime's handle is kept
/// for work started from the poller thread.
pub fn create_relay_service(
    config: Config,
    broker: Arc<dyn Broker>,
) -> Result<(RelayService, RelayWorkers), RelayError> {
    let runtime = Handle::try_current().map_err(|e| RelayError::Runtime(e.to_string()))?;
    let (producer, producer_worker) = create_producer_lane(Arc::clone(&broker));

    let mut dispatcher = None;
    let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
        let handler: Arc<dyn EventHandler> = Arc::new(RelayEvents {
            shared: weak.clone(),
        });
        let (bridge, bridge_dispatcher) = create_bridge(
            handler,
            config.relay.bridge_capacity,
            Duration::from_millis(config.relay.bridge_timeout_ms),
        );
        dispatcher = Some(bridge_dispatcher);

        Shared {
            registry: CheckpointRegistry::new(),
            bridge,
            status: Arc::new(StatusMachine::new()),
            mileage: Mutex::new(0.0),
            journal: Mutex::new(Journal::default()),
            hub: Hub::new(config.relay.subscriber_buffer),
            producer,
            delivered: AtomicU64::new(0),
            runs: RunCounter::new(),
            poller: Mutex::new(None),
            runtime,
            broker,
            config,
        }
    });

    let dispatcher = dispatcher.ok_or_else(|| RelayError::Runtime("bridge not created".into()))?;
    let workers = RelayWorkers {
        dispatcher,
        producer: producer_worker,
    };
    Ok((RelayService { shared }, workers))
}

/// Create a relay service and spawn its workers on the current runtime.
pub fn start_relay_service(
    config: Config,
    broker: Arc<dyn Broker>,
) -> Result<RelayService, RelayError> {
    let (service, workers) = create_relay_service(config, broker)?;
    tokio::spawn(workers.run());
    Ok(service)
}

impl RelayService {
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn broker_name(&self) -> &'static str {
        self.shared.broker.name()
    }

    pub fn status(&self) -> ServiceStatus {
        self.shared.status.current()
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.stats()
    }

    /// Emit an operator-facing log line to tracing and every subscriber.
    pub fn log(&self, message: &str) {
        self.shared.log(message);
    }

    /// Subscribe to relay events.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<RelayMessage>) {
        self.shared.hub.connect()
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.shared.hub.disconnect(id)
    }

    /// Send a message to one subscriber only.
    pub fn send_to(&self, id: Uuid, message: RelayMessage) -> bool {
        self.shared.hub.send_to(id, message)
    }

    /// Every instruction consumed since the last reset, in offset order.
    pub fn instructions(&self) -> Vec<Instruction> {
        lock(&self.shared.journal).instructions.clone()
    }

    /// The next instruction not yet served by this call, if any.
    pub fn next_instruction(&self) -> Option<Instruction> {
        let mut journal = lock(&self.shared.journal);
        let next = journal.instructions.get(journal.cursor).cloned()?;
        journal.cursor += 1;
        Some(next)
    }

    pub fn pending_checkpoints(&self) -> usize {
        self.shared.registry.pending_count()
    }

    /// Produce the ready signal once, then start consuming.
    pub async fn send_ready(&self) -> Result<Delivery, RelayError> {
        let claim = self.shared.status.claim_ready()?;
        let broker = &self.shared.config.broker;

        self.shared.log("🏁 Sending ready signal...");
        let payload = serde_json::to_vec(&Ready::new(&broker.consumer_group, READY_MESSAGE))?;
        let delivery = match self
            .shared
            .producer
            .send(&broker.checkpoint_topic, &broker.consumer_group, payload)
            .await
        {
            Ok(delivery) => delivery,
            Err(e) => {
                self.shared
                    .log_error(&format!("❌ Failed to send ready signal: {}", e));
                return Err(e.into());
            }
        };

        claim.commit()?;
        self.shared.log(&format!(
            "✅ Ready signal sent to {} (offset {})",
            delivery.topic, delivery.offset
        ));
        self.shared.status_changed(ServiceStatus::Ready);

        self.start_consumption()?;
        Ok(delivery)
    }

    /// Move READY → DRIVING and start the poller thread.
    pub fn start_consumption(&self) -> Result<(), RelayError> {
        {
            let mut poller = lock(&self.shared.poller);
            if poller.as_ref().is_some_and(|p| !p.is_finished()) {
                debug!("Poller already running");
                return Ok(());
            }
            if let Some(finished) = poller.take() {
                if finished.join().is_err() {
                    warn!("Previous poller thread had panicked");
                }
            }
        }

        // Only the caller that performs the transition starts a poller.
        if self.shared.status.transition(ServiceStatus::Driving)?.is_none() {
            return Ok(());
        }
        self.shared.status_changed(ServiceStatus::Driving);

        let run = self.shared.runs.current();
        match spawn_poller(Arc::clone(&self.shared), run) {
            Ok(handle) => {
                *lock(&self.shared.poller) = Some(handle);
                let assignment = self.shared.assignment();
                self.shared.log(&format!(
                    "🚗 Consuming {}:{} as group {}",
                    assignment.topic, assignment.partition, assignment.group
                ));
                Ok(())
            }
            Err(e) => {
                let _ = self.shared.set_status(ServiceStatus::Idle);
                self.shared
                    .log_error(&format!("❌ Failed to start poller: {}", e));
                Err(RelayError::PollerSpawn(e.to_string()))
            }
        }
    }

    /// [`send_ready`](Self::send_ready) bounded by `start_race_timeout_secs`.
    pub async fn start_race(&self) -> ActionResponse {
        let limit = Duration::from_secs(self.shared.config.relay.start_race_timeout_secs);
        match tokio::time::timeout(limit, self.send_ready()).await {
            Ok(Ok(_)) => ActionResponse::ok("Race started"),
            Ok(Err(e)) => ActionResponse::failed(format!("Failed to start race: {}", e)),
            Err(_) => {
                self.shared.log_error(&format!(
                    "⏱️ Race start timed out after {}s",
                    limit.as_secs()
                ));
                ActionResponse::failed("Race start timeout - check broker connectivity")
            }
        }
    }

    /// Accept a checkpoint from a client: release its step and forward it to
    /// the checkpoint topic.
    pub async fn submit_checkpoint(&self, checkpoint: Checkpoint) -> Result<Delivery, RelayError> {
        validate_checkpoint(&checkpoint)?;
        if self.shared.config.relay.checkpoint_source == CheckpointSource::Auto {
            debug!("Client checkpoint for step {} while relay produces its own", checkpoint.step);
        }

        self.shared.registry.deliver_checkpoint(&checkpoint.step);
        let payload = serde_json::to_vec(&checkpoint)?;
        let result = self
            .shared
            .producer
            .send(
                &self.shared.config.broker.checkpoint_topic,
                &self.shared.config.broker.consumer_group,
                payload,
            )
            .await;
        self.shared.checkpoint_sent(&checkpoint.step, result.clone());
        Ok(result?)
    }

    /// Ask the poller to stop without waiting for it. Callable from any thread.
    pub fn request_stop(&self) {
        if let Some(poller) = lock(&self.shared.poller).as_ref() {
            poller.signal_stop();
        }
    }

    /// Halt the poller and return to IDLE.
    pub async fn stop(&self) {
        self.shared.halt().await;
        if let Err(e) = self.shared.set_status(ServiceStatus::Idle) {
            warn!("Failed to set status on stop: {}", e);
        }
        self.shared.log("⏹️ Service stopped");
    }

    /// Halt the poller and clear all relay state.
    pub async fn reset(&self) {
        self.shared.halt().await;
        {
            let mut journal = lock(&self.shared.journal);
            journal.instructions.clear();
            journal.cursor = 0;
        }
        self.shared.delivered.store(0, Ordering::Relaxed);
        let previous = self.shared.status.reset();
        if previous != ServiceStatus::Idle {
            self.shared.log(&format!("Status updated: {}", ServiceStatus::Idle));
        }
        self.shared.log("🔄 Service reset");
        self.shared
            .bridge
            .submit(RelayEvent::Status(self.shared.stats()));
    }

    /// Probe the broker: transport reachability, a producer round-trip, then
    /// a metadata fetch for the instruction topic. Stops at the first failure.
    pub async fn test_connectivity(&self) -> ConnectivityReport {
        let broker = &self.shared.config.broker;
        let mut stages = Vec::new();

        let reachable = self.shared.broker.ping().await;
        if !record_stage(&mut stages, "tcp", reachable) {
            return connectivity_report(stages);
        }

        let produce_timeout = Duration::from_secs(broker.produce_timeout_secs);
        let payload = serde_json::json!({ "test": "connectivity" }).to_string().into_bytes();
        let produced = match tokio::time::timeout(
            produce_timeout,
            self.shared
                .producer
                .send(&broker.checkpoint_topic, "test", payload),
        )
        .await
        {
            Ok(Ok(delivery)) => Ok(format!(
                "Test record acknowledged on {}:{} at offset {}",
                delivery.topic, delivery.partition, delivery.offset
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "No acknowledgment within {}s",
                produce_timeout.as_secs()
            )),
        };
        if !record_stage(&mut stages, "producer", produced) {
            return connectivity_report(stages);
        }

        let metadata = match self.shared.broker.topic_exists(&broker.instruction_topic).await {
            Ok(true) => Ok(format!("Topic '{}' found", broker.instruction_topic)),
            Ok(false) => Err(format!("Topic '{}' not found", broker.instruction_topic)),
            Err(e) => Err(e.to_string()),
        };
        record_stage(&mut stages, "metadata", metadata);
        connectivity_report(stages)
    }
}

fn record_stage<E: ToString>(
    stages: &mut Vec<ConnectivityStage>,
    stage: &str,
    result: Result<String, E>,
) -> bool {
    let (success, detail) = match result {
        Ok(detail) => (true, detail),
        Err(e) => (false, e.to_string()),
    };
    stages.push(ConnectivityStage {
        stage: stage.to_string(),
        success,
        detail,
    });
    success
}

fn connectivity_report(stages: Vec<ConnectivityStage>) -> ConnectivityReport {
    match stages.iter().find(|s| !s.success) {
        Some(failed) => ConnectivityReport {
            success: false,
            message: format!("Connectivity test failed at {} stage", failed.stage),
            stages,
        },
        None => ConnectivityReport {
            success: true,
            message: "Connectivity test passed".to_string(),
            stages,
        },
    }
}
