//! Service status state machine.
//!
//! ```text
//! IDLE ──send_ready──▶ READY ──start_consumption──▶ DRIVING ──exhausted──▶ COMPLETED
//!   ▲                                                                        │
//!   └──────────────────────────── stop / reset (from any state) ─────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Process-wide relay status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Idle,
    Ready,
    Driving,
    Completed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Idle => "IDLE",
            ServiceStatus::Ready => "READY",
            ServiceStatus::Driving => "DRIVING",
            ServiceStatus::Completed => "COMPLETED",
        }
    }

    /// Whether `self → next` is a documented transition.
    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        matches!(
            (self, next),
            (_, ServiceStatus::Idle)
                | (ServiceStatus::Idle, ServiceStatus::Ready)
                | (ServiceStatus::Ready, ServiceStatus::Driving)
                | (ServiceStatus::Driving, ServiceStatus::Completed)
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the status machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("Ready signal already sent")]
    AlreadySent,

    #[error("Ready signal already being sent")]
    InFlight,

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ServiceStatus,
        to: ServiceStatus,
    },

    /// The machine was reset while the claim was outstanding.
    #[error("Ready claim superseded by a reset")]
    Superseded,
}

#[derive(Debug)]
struct Inner {
    status: ServiceStatus,
    ready_sent: bool,
    ready_in_flight: bool,
    /// Bumped on every reset; stale claims compare against it.
    epoch: u64,
}

/// Status plus the ready-once flag, behind a single mutex.
#[derive(Debug)]
pub struct StatusMachine {
    inner: Mutex<Inner>,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: ServiceStatus::Idle,
                ready_sent: false,
                ready_in_flight: false,
                epoch: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> ServiceStatus {
        self.lock().status
    }

    pub fn ready_sent(&self) -> bool {
        self.lock().ready_sent
    }

    /// Reserve the right to send the ready signal.
    ///
    /// The claim is released when dropped unless [`ReadyClaim::commit`] was
    /// called, so a failed or timed-out send can be retried.
    pub fn claim_ready(self: &Arc<Self>) -> Result<ReadyClaim, StatusError> {
        let mut inner = self.lock();
        if inner.ready_sent {
            return Err(StatusError::AlreadySent);
        }
        if inner.ready_in_flight {
            return Err(StatusError::InFlight);
        }
        if !inner.status.can_transition_to(ServiceStatus::Ready) {
            return Err(StatusError::InvalidTransition {
                from: inner.status,
                to: ServiceStatus::Ready,
            });
        }
        inner.ready_in_flight = true;

        Ok(ReadyClaim {
            machine: Arc::clone(self),
            epoch: inner.epoch,
            settled: false,
        })
    }

    /// Move to `to`. Returns the previous status, or `None` if already there.
    pub fn transition(&self, to: ServiceStatus) -> Result<Option<ServiceStatus>, StatusError> {
        let mut inner = self.lock();
        let from = inner.status;
        if from == to {
            return Ok(None);
        }
        if !from.can_transition_to(to) {
            return Err(StatusError::InvalidTransition { from, to });
        }
        inner.status = to;
        Ok(Some(from))
    }

    /// Back to IDLE with the ready flag cleared. Outstanding claims become stale.
    pub fn reset(&self) -> ServiceStatus {
        let mut inner = self.lock();
        let previous = inner.status;
        inner.status = ServiceStatus::Idle;
        inner.ready_sent = false;
        inner.ready_in_flight = false;
        inner.epoch += 1;
        previous
    }
}

/// An in-flight ready send.
#[derive(Debug)]
pub struct ReadyClaim {
    machine: Arc<StatusMachine>,
    epoch: u64,
    settled: bool,
}

impl ReadyClaim {
    /// Record the ready signal as sent and move IDLE → READY.
    pub fn commit(mut self) -> Result<(), StatusError> {
        self.settled = true;
        let mut inner = self.machine.lock();
        if inner.epoch != self.epoch {
            return Err(StatusError::Superseded);
        }
        inner.ready_in_flight = false;
        if !inner.status.can_transition_to(ServiceStatus::Ready) {
            return Err(StatusError::InvalidTransition {
                from: inner.status,
                to: ServiceStatus::Ready,
            });
        }
        inner.ready_sent = true;
        inner.status = ServiceStatus::Ready;
        Ok(())
    }
}

impl Drop for ReadyClaim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.machine.lock();
        if inner.epoch == self.epoch {
            inner.ready_in_flight = false;
        }
    }
}
