//! Partition poller.
//!
//! A dedicated OS thread owns the consumer for its whole life: it polls,
//! decodes, hands instructions to the bridge and performs every offset
//! commit, including the ones requested by checkpoint waiters.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::bridge::RelayEvent;
use super::checkpoint::{CommitRequest, Committer};
use super::service::Shared;
use super::status::ServiceStatus;
use crate::broker::{BrokerMessage, ConsumerGuard, MessageHandle, PollOutcome};
use crate::config::{CheckpointSource, CommitPolicy};
use crate::messages::decode_instruction;
use crate::metrics;

/// Upper bound on waiting for outstanding checkpoints once the stream ends.
const DRAIN_LIMIT: Duration = Duration::from_secs(10);

/// Handle to a running poller thread.
pub(crate) struct PollerHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl PollerHandle {
    /// Ask the loop to exit; observed within one poll timeout.
    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the thread exits.
    pub(crate) fn join(self) -> thread::Result<()> {
        self.signal_stop();
        self.thread.join()
    }
}

/// Start the poller thread for consumption run `run`.
pub(crate) fn spawn_poller(shared: Arc<Shared>, run_id: u64) -> io::Result<PollerHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread = thread::Builder::new()
        .name("relay-poller".to_string())
        .spawn({
            let stop = Arc::clone(&stop);
            move || run(&shared, &stop, run_id)
        })?;
    Ok(PollerHandle { stop, thread })
}

fn run(shared: &Shared, stop: &AtomicBool, run_id: u64) {
    let assignment = shared.assignment();
    let mut consumer = match shared.broker.open_consumer(&assignment) {
        Ok(consumer) => ConsumerGuard::new(consumer),
        Err(e) => {
            shared.log_error(&format!("❌ Failed to open consumer: {}", e));
            return;
        }
    };
    info!(
        "Poller attached to {}:{} (start offset {:?})",
        assignment.topic, assignment.partition, assignment.start_offset
    );

    let (committer, commit_requests) = std_mpsc::channel::<CommitRequest>();
    let poll_timeout = Duration::from_millis(shared.config.relay.poll_timeout_ms);
    let error_backoff = Duration::from_millis(shared.config.relay.error_backoff_ms);

    loop {
        serve_commits(&mut consumer, &commit_requests);
        if stop.load(Ordering::SeqCst) {
            debug!("Poller stop requested");
            break;
        }

        match consumer.poll(poll_timeout) {
            Ok(PollOutcome::Empty) => {}
            Ok(PollOutcome::PartitionEof) => debug!("Caught up with partition end"),
            Ok(PollOutcome::Message(message)) => {
                handle_record(shared, &mut consumer, &committer, message, run_id);
            }
            Ok(PollOutcome::Exhausted) => {
                shared.log("🏁 Instruction stream exhausted");
                drain_commits(shared, &mut consumer, &commit_requests, stop, poll_timeout);
                if let Err(e) = shared.set_status(ServiceStatus::Completed) {
                    debug!("Not marking completed: {}", e);
                }
                break;
            }
            Err(e) if e.is_fatal() => {
                // Status is left as is; an operator must reset.
                shared.log_error(&format!("💥 Fatal consumer error, poller exiting: {}", e));
                break;
            }
            Err(e) => {
                metrics::POLL_ERRORS.inc();
                shared.log_warning(&format!("⚠️ Poll error: {}", e));
                thread::sleep(error_backoff);
            }
        }
    }

    serve_commits(&mut consumer, &commit_requests);
    drop(commit_requests);
    drop(consumer);
    info!("Poller stopped, consumer closed");
}

/// Commit everything waiters have asked for so far.
fn serve_commits(consumer: &mut ConsumerGuard, requests: &std_mpsc::Receiver<CommitRequest>) {
    while let Ok(request) = requests.try_recv() {
        serve(consumer, request);
    }
}

fn serve(consumer: &mut ConsumerGuard, request: CommitRequest) {
    let result = consumer.commit(&request.handle);
    record_commit("checkpoint", &result);
    // Waiter may have been cancelled.
    let _ = request.reply.send(result);
}

/// Keep serving commits until no step is left waiting, the stop flag is
/// raised or [`DRAIN_LIMIT`] elapses.
fn drain_commits(
    shared: &Shared,
    consumer: &mut ConsumerGuard,
    requests: &std_mpsc::Receiver<CommitRequest>,
    stop: &AtomicBool,
    poll_timeout: Duration,
) {
    let deadline = Instant::now() + DRAIN_LIMIT;
    while !stop.load(Ordering::SeqCst) && Instant::now() < deadline {
        match requests.recv_timeout(poll_timeout) {
            Ok(request) => serve(consumer, request),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if shared.registry.pending_count() == 0 {
                    return;
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
    if shared.registry.pending_count() > 0 {
        shared.log_warning(&format!(
            "⚠️ {} step(s) still awaiting checkpoints at end of stream",
            shared.registry.pending_count()
        ));
    }
}

fn handle_record(
    shared: &Shared,
    consumer: &mut ConsumerGuard,
    committer: &Committer,
    message: BrokerMessage,
    run_id: u64,
) {
    let handle = message.handle;
    let instruction = match decode_instruction(&message.payload) {
        Ok(instruction) => instruction,
        Err(e) => {
            metrics::INSTRUCTIONS_CONSUMED
                .with_label_values(&["invalid"])
                .inc();
            shared.log_warning(&format!(
                "⚠️ Skipping invalid message at offset {}: {}",
                handle.offset, e
            ));
            commit_now(shared, consumer, &handle, "poison");
            return;
        }
    };
    metrics::INSTRUCTIONS_CONSUMED
        .with_label_values(&["valid"])
        .inc();

    let km_travelled = shared.record_instruction(&instruction);
    shared.log(&format!(
        "📍 Instruction {}: {} → {} (+{} km)",
        instruction.id, instruction.action, instruction.target, instruction.km_gain
    ));

    let step = instruction.step().to_string();
    let relay = &shared.config.relay;

    if relay.commit_policy == CommitPolicy::OnCheckpoint {
        // Registered before anything reaches the runtime, so a checkpoint
        // can never arrive ahead of its signal.
        shared
            .registry
            .register_pending(&step, handle.clone(), committer.clone());
        shared.bridge.submit(RelayEvent::AwaitCheckpoint {
            step: step.clone(),
            run: run_id,
        });
    }

    shared.bridge.submit(RelayEvent::Instruction {
        instruction,
        run: run_id,
    });

    if relay.checkpoint_source == CheckpointSource::Auto {
        shared.bridge.submit(RelayEvent::ProduceCheckpoint {
            step,
            km_travelled,
            run: run_id,
        });
    }

    if relay.commit_policy == CommitPolicy::Immediate {
        commit_now(shared, consumer, &handle, "immediate");
    }
}

fn commit_now(shared: &Shared, consumer: &mut ConsumerGuard, handle: &MessageHandle, reason: &str) {
    let result = consumer.commit(handle);
    record_commit(reason, &result);
    match result {
        Ok(()) => debug!("Committed offset {} ({})", handle.offset, reason),
        Err(e) => shared.log_warning(&format!(
            "❌ Commit of offset {} failed: {}",
            handle.offset, e
        )),
    }
}

fn record_commit<E>(reason: &str, result: &Result<(), E>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::OFFSETS_COMMITTED
        .with_label_values(&[reason, outcome])
        .inc();
}
