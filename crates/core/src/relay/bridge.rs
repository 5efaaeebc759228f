//! Hand-off of relay events from the poller thread to the runtime.
//!
//! Events travel through a bounded channel to a [`Dispatcher`] running on the
//! Tokio runtime, which processes them in submission order. A submitter that
//! already runs inside a runtime executes the event directly.
//!
//! If the channel stays full past the configured deadline the event is
//! executed on the submitting thread instead. That keeps the event but may
//! reorder it relative to events still queued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::messages::Instruction;
use crate::metrics;

use super::types::RelayStats;

/// Event crossing from the poller to the runtime.
///
/// Events that carry a `run` belong to one consumption run and are
/// discarded by the handler once that run has ended.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Fan an instruction out to subscribers.
    Instruction { instruction: Instruction, run: u64 },
    /// Start waiting for the checkpoint of `step`.
    AwaitCheckpoint { step: String, run: u64 },
    /// Produce the checkpoint of `step` on the relay's behalf.
    ProduceCheckpoint {
        step: String,
        km_travelled: f64,
        run: u64,
    },
    /// Operator-facing log line, already formatted.
    Log(String),
    /// Status snapshot to fan out.
    Status(RelayStats),
}

impl RelayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::Instruction { .. } => "instruction",
            RelayEvent::AwaitCheckpoint { .. } => "await_checkpoint",
            RelayEvent::ProduceCheckpoint { .. } => "produce_checkpoint",
            RelayEvent::Log(_) => "log",
            RelayEvent::Status(_) => "status",
        }
    }

    /// The consumption run the event belongs to, if any.
    pub fn run(&self) -> Option<u64> {
        match self {
            RelayEvent::Instruction { run, .. }
            | RelayEvent::AwaitCheckpoint { run, .. }
            | RelayEvent::ProduceCheckpoint { run, .. } => Some(*run),
            RelayEvent::Log(_) | RelayEvent::Status(_) => None,
        }
    }
}

/// Executes relay events. Must be callable from any thread.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: RelayEvent);
}

/// How a submission was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Executed on the caller, which was already on the runtime.
    Direct,
    /// Queued for the dispatcher.
    Scheduled,
    /// Queue unavailable before the deadline; executed on the caller.
    Degraded,
}

impl Submission {
    fn as_str(&self) -> &'static str {
        match self {
            Submission::Direct => "direct",
            Submission::Scheduled => "scheduled",
            Submission::Degraded => "degraded",
        }
    }
}

const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Submitting side of the bridge. Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    tx: mpsc::Sender<RelayEvent>,
    handler: Arc<dyn EventHandler>,
    timeout: Duration,
}

impl Bridge {
    /// Hand `event` to the runtime.
    pub fn submit(&self, event: RelayEvent) -> Submission {
        let outcome = if Handle::try_current().is_ok() {
            self.handler.handle(event);
            Submission::Direct
        } else {
            self.schedule(event)
        };

        metrics::BRIDGE_SUBMISSIONS
            .with_label_values(&[outcome.as_str()])
            .inc();
        outcome
    }

    fn schedule(&self, event: RelayEvent) -> Submission {
        let deadline = Instant::now() + self.timeout;
        let mut event = event;

        loop {
            match self.tx.try_send(event) {
                Ok(()) => return Submission::Scheduled,
                Err(TrySendError::Closed(returned)) => {
                    debug!("Bridge closed, executing {} inline", returned.kind());
                    event = returned;
                    break;
                }
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        warn!(
                            "Bridge full for {:?}, executing {} inline",
                            self.timeout,
                            returned.kind()
                        );
                        event = returned;
                        break;
                    }
                    event = returned;
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        }

        self.handler.handle(event);
        Submission::Degraded
    }
}

/// Runtime side of the bridge; spawn with `tokio::spawn(dispatcher.run())`.
pub struct Dispatcher {
    rx: mpsc::Receiver<RelayEvent>,
    handler: Arc<dyn EventHandler>,
}

impl Dispatcher {
    /// Process events until every [`Bridge`] is dropped.
    pub async fn run(mut self) {
        debug!("Bridge dispatcher started");
        while let Some(event) = self.rx.recv().await {
            self.handler.handle(event);
        }
        debug!("Bridge dispatcher shutting down");
    }
}

/// Create both halves of a bridge.
///
/// # Arguments
/// * `handler` - executes every event, on whichever side runs it
/// * `capacity` - bound of the event queue
/// * `timeout` - how long a foreign thread retries a full queue before degrading
pub fn create_bridge(
    handler: Arc<dyn EventHandler>,
    capacity: usize,
    timeout: Duration,
) -> (Bridge, Dispatcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let bridge = Bridge {
        tx,
        handler: Arc::clone(&handler),
        timeout,
    };
    let dispatcher = Dispatcher { rx, handler };
    (bridge, dispatcher)
}
