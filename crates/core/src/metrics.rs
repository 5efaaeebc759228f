//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Poller (instructions consumed, poll errors, offset commits)
//! - Checkpoint protocol (checkpoints produced, wait duration)
//! - Bridge (submissions by outcome)
//! - Fan-out (events skipped for lagging subscribers)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Poller Metrics
// =============================================================================

/// Instructions consumed by decode result.
pub static INSTRUCTIONS_CONSUMED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "relay_instructions_consumed_total",
            "Total records consumed from the instruction partition",
        ),
        &["result"], // "valid", "invalid"
    )
    .unwrap()
});

/// Offsets committed by reason.
pub static OFFSETS_COMMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("relay_offsets_committed_total", "Total offset commits"),
        &["reason", "result"], // reason: "immediate", "checkpoint", "poison"; result: "ok", "error"
    )
    .unwrap()
});

/// Transient poll errors.
pub static POLL_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "relay_poll_errors_total",
        "Total transient errors returned by the broker poll",
    )
    .unwrap()
});

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Checkpoints produced by result.
pub static CHECKPOINTS_PRODUCED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "relay_checkpoints_produced_total",
            "Total checkpoints produced to the checkpoint topic",
        ),
        &["result"], // "ok", "error"
    )
    .unwrap()
});

/// Time between registering a pending commit and resolving it.
pub static CHECKPOINT_WAIT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "relay_checkpoint_wait_seconds",
            "Time spent waiting for a step's checkpoint",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["outcome"], // "committed", "commit_failed", "dropped", "cancelled", "expired"
    )
    .unwrap()
});

// =============================================================================
// Bridge Metrics
// =============================================================================

/// Bridge submissions by outcome.
pub static BRIDGE_SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "relay_bridge_submissions_total",
            "Total events handed across the bridge",
        ),
        &["outcome"], // "direct", "scheduled", "degraded"
    )
    .unwrap()
});

// =============================================================================
// Fan-out Metrics
// =============================================================================

/// Events a subscriber missed because its queue was full.
pub static SUBSCRIBER_EVENTS_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "relay_subscriber_events_skipped_total",
        "Total events skipped for subscribers whose queue was full",
    )
    .unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Poller
        Box::new(INSTRUCTIONS_CONSUMED.clone()),
        Box::new(OFFSETS_COMMITTED.clone()),
        Box::new(POLL_ERRORS.clone()),
        // Checkpoints
        Box::new(CHECKPOINTS_PRODUCED.clone()),
        Box::new(CHECKPOINT_WAIT_DURATION.clone()),
        // Bridge
        Box::new(BRIDGE_SUBMISSIONS.clone()),
        // Fan-out
        Box::new(SUBSCRIBER_EVENTS_SKIPPED.clone()),
    ]
}
