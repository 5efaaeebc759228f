//! Checkpoint-gated commit protocol.
//!
//! A message consumed under the `on_checkpoint` policy is registered as a
//! pending commit keyed by its step. Its offset is committed only after the
//! step's checkpoint signal is set. The commit itself is executed by the
//! poller thread that owns the consumer; waiters send it a [`CommitRequest`].

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::{BrokerError, MessageHandle};
use crate::metrics;

/// Request for the poller to commit a handle on behalf of a waiter.
#[derive(Debug)]
pub struct CommitRequest {
    pub handle: MessageHandle,
    pub reply: oneshot::Sender<Result<(), BrokerError>>,
}

/// Channel into the poller that owns the consumer.
pub type Committer = std_mpsc::Sender<CommitRequest>;

/// Ways a checkpoint wait can end without a commit.
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    #[error("commit failed: {0}")]
    CommitFailed(BrokerError),

    #[error("poller stopped before committing; the record will be redelivered")]
    PollerStopped,

    #[error("registry cleared while waiting")]
    Cancelled,

    #[error("no pending commit for step")]
    NothingPending,

    #[error("checkpoint not received within {0:?}")]
    Expired(Duration),
}

impl CheckpointError {
    fn label(&self) -> &'static str {
        match self {
            CheckpointError::CommitFailed(_) => "commit_failed",
            CheckpointError::PollerStopped => "dropped",
            CheckpointError::Cancelled => "cancelled",
            CheckpointError::NothingPending => "nothing_pending",
            CheckpointError::Expired(_) => "expired",
        }
    }
}

/// Result of setting a step's checkpoint signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The signal was already set; nothing changed.
    AlreadyDelivered,
    /// No signal exists for the step; the checkpoint is dropped.
    Unknown,
}

#[derive(Debug)]
struct Signal {
    tx: Option<oneshot::Sender<()>>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Signal {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

#[derive(Debug)]
struct PendingCommit {
    handle: MessageHandle,
    committer: Committer,
}

#[derive(Debug, Default)]
struct Registries {
    signals: HashMap<String, Signal>,
    pending: HashMap<String, PendingCommit>,
    /// Bumped by `clear`; waiters from an older epoch resolve as cancelled.
    epoch: u64,
}

/// Pending commits and checkpoint signals, shared by the poller thread and
/// the runtime.
#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    inner: Mutex<Registries>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handle` as awaiting the checkpoint for `step`.
    ///
    /// Creates the step's signal if needed. A second registration for a step
    /// that is still pending replaces the handle with the newer one.
    pub fn register_pending(&self, step: &str, handle: MessageHandle, committer: Committer) {
        let mut inner = self.lock();
        inner
            .signals
            .entry(step.to_string())
            .or_insert_with(Signal::new);
        if let Some(previous) = inner
            .pending
            .insert(step.to_string(), PendingCommit { handle, committer })
        {
            warn!(
                "Duplicate step {}: replacing pending offset {}",
                step, previous.handle.offset
            );
        }
    }

    /// Set the checkpoint signal for `step`.
    pub fn deliver_checkpoint(&self, step: &str) -> SignalOutcome {
        let mut inner = self.lock();
        let Some(signal) = inner.signals.get_mut(step) else {
            warn!("Checkpoint for step {} has no registered waiter, dropping", step);
            return SignalOutcome::Unknown;
        };
        match signal.tx.take() {
            Some(tx) => {
                // The receiver may already be gone if the waiter expired.
                let _ = tx.send(());
                SignalOutcome::Delivered
            }
            None => {
                debug!("Checkpoint for step {} already delivered", step);
                SignalOutcome::AlreadyDelivered
            }
        }
    }

    /// Wait for the checkpoint of `step`, then have the poller commit the
    /// pending handle. Returns the committed offset.
    ///
    /// Only one waiter per step is served; a second concurrent waiter gets
    /// [`CheckpointError::NothingPending`].
    pub async fn await_checkpoint(
        &self,
        step: &str,
        timeout: Option<Duration>,
    ) -> Result<i64, CheckpointError> {
        let started = Instant::now();
        let result = self.wait_and_commit(step, timeout).await;

        let outcome = match &result {
            Ok(_) => "committed",
            Err(e) => e.label(),
        };
        metrics::CHECKPOINT_WAIT_DURATION
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn wait_and_commit(
        &self,
        step: &str,
        timeout: Option<Duration>,
    ) -> Result<i64, CheckpointError> {
        let (rx, epoch) = {
            let mut inner = self.lock();
            let epoch = inner.epoch;
            let rx = inner
                .signals
                .get_mut(step)
                .and_then(|signal| signal.rx.take())
                .ok_or(CheckpointError::NothingPending)?;
            (rx, epoch)
        };

        let signalled = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result,
                Err(_) => {
                    let mut inner = self.lock();
                    if inner.epoch == epoch {
                        inner.signals.remove(step);
                        inner.pending.remove(step);
                    }
                    return Err(CheckpointError::Expired(limit));
                }
            },
            None => rx.await,
        };
        if signalled.is_err() {
            return Err(CheckpointError::Cancelled);
        }

        let pending = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return Err(CheckpointError::Cancelled);
            }
            inner.signals.remove(step);
            inner
                .pending
                .remove(step)
                .ok_or(CheckpointError::NothingPending)?
        };

        let offset = pending.handle.offset;
        let (reply_tx, reply_rx) = oneshot::channel();
        pending
            .committer
            .send(CommitRequest {
                handle: pending.handle,
                reply: reply_tx,
            })
            .map_err(|_| CheckpointError::PollerStopped)?;

        match reply_rx.await {
            Ok(Ok(())) => Ok(offset),
            Ok(Err(e)) => Err(CheckpointError::CommitFailed(e)),
            Err(_) => Err(CheckpointError::PollerStopped),
        }
    }

    /// Steps whose commit is still pending.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Signals that have not been consumed yet.
    pub fn signal_count(&self) -> usize {
        self.lock().signals.len()
    }

    /// Drop every signal and pending commit. Outstanding waiters resolve as
    /// [`CheckpointError::Cancelled`].
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.signals.clear();
        inner.pending.clear();
    }
}
