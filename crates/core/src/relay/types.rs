//! Types for the relay service.

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::status::{ServiceStatus, StatusError};
use crate::broker::BrokerError;
use crate::messages::DecodeError;

/// Errors that can occur during relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Status machine rejected the operation.
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Broker operation failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Payload failed validation.
    #[error("invalid payload: {0}")]
    Invalid(#[from] DecodeError),

    /// Payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The poller thread could not be started.
    #[error("failed to start poller: {0}")]
    PollerSpawn(String),

    /// The service was created outside a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    Runtime(String),
}

/// Snapshot of the relay's state for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayStats {
    pub status: ServiceStatus,
    /// Whether the ready signal has been sent in this cycle.
    pub ready_sent: bool,
    /// Whether a poller thread is running.
    pub consuming: bool,
    pub total_km_travelled: f64,
    /// Valid instructions consumed since the last reset.
    pub instructions_processed: usize,
    /// Instructions fanned out to subscribers since the last reset.
    pub instructions_delivered: u64,
    pub pending_checkpoints: usize,
    pub subscribers: usize,
}

/// Outcome of an operator action, as returned by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// One stage of the connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStage {
    pub stage: String,
    pub success: bool,
    pub detail: String,
}

/// Result of the three-stage connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub success: bool,
    pub message: String,
    pub stages: Vec<ConnectivityStage>,
}

/// Format an operator-facing log line as `[HH:MM:SS] message`.
pub fn relay_line(message: &str) -> String {
    format!("[{}] {}", Local::now().format("%H:%M:%S"), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_line_format() {
        let line = relay_line("Status updated: READY");
        assert!(line.starts_with('['));
        assert_eq!(&line[9..11], "] ");
        assert!(line.ends_with("Status updated: READY"));
    }

    #[test]
    fn test_stats_serialization() {
        let stats = RelayStats {
            status: ServiceStatus::Driving,
            ready_sent: true,
            consuming: true,
            total_km_travelled: 0.35,
            instructions_processed: 3,
            instructions_delivered: 3,
            pending_checkpoints: 1,
            subscribers: 2,
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["status"], "DRIVING");
        assert_eq!(json["total_km_travelled"], 0.35);
        assert_eq!(json["pending_checkpoints"], 1);
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::from(StatusError::AlreadySent);
        assert_eq!(err.to_string(), "Ready signal already sent");
    }
}
