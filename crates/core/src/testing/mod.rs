//! Testing utilities for relay tests.
//!
//! The broker test double is [`MemoryBroker`](crate::broker::MemoryBroker);
//! this module supplies fixtures and a polling helper on top of it.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_core::testing::fixtures;
//!
//! let broker = MemoryBroker::new();
//! let config = fixtures::fast_config();
//! broker.append_json(&config.broker.instruction_topic, 0, &fixtures::instruction("1", "start", 0.0));
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing with `None` after `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(timeout, future).await.ok()
}

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::config::{BrokerBackend, CheckpointSource, CommitPolicy, Config};
    use crate::messages::{Checkpoint, Instruction};

    /// Create an instruction with reasonable defaults.
    pub fn instruction(id: &str, action: &str, km_gain: f64) -> Instruction {
        Instruction {
            id: id.to_string(),
            kind: "instruction".to_string(),
            action: action.to_string(),
            target: format!("Waypoint {}", id),
            km_gain,
            latitude: None,
            longitude: None,
        }
    }

    /// The two-step scenario used throughout the tests: start, then 0.2 km forward.
    pub fn start_then_forward() -> Vec<Instruction> {
        vec![
            instruction("1", "start", 0.0),
            instruction("2", "go_forward", 0.2),
        ]
    }

    /// A checkpoint as a client would post it.
    pub fn checkpoint(step: &str, km_travelled: f64) -> Checkpoint {
        Checkpoint::new(step, step, "pilot", km_travelled)
    }

    /// Payloads that must be rejected by instruction decoding.
    pub fn malformed_payloads() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            b"not json".to_vec(),
            br#"{"id":"9","type":"instruction"}"#.to_vec(),
            br#"{"id":"9","type":"instruction","action":"go","target":"x","km_gain":-1.0}"#
                .to_vec(),
            vec![0xff, 0xfe, 0xfd],
        ]
    }

    /// Configuration with short timeouts, suitable for in-process tests.
    pub fn fast_config() -> Config {
        let mut config = Config::default();
        config.broker.backend = BrokerBackend::Simulation;
        config.relay.commit_policy = CommitPolicy::OnCheckpoint;
        config.relay.checkpoint_source = CheckpointSource::Auto;
        config.relay.poll_timeout_ms = 20;
        config.relay.error_backoff_ms = 10;
        config.relay.start_race_timeout_secs = 2;
        config.relay.simulation_interval_ms = 1;
        config
    }
}
