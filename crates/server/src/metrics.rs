//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the relay server:
//! - HTTP request metrics (latency, counts)
//! - WebSocket connection and message metrics
//! - Relay state gauges (collected dynamically on scrape)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use relay_core::ServiceStatus;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "relay_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("relay_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "relay_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// WebSocket Metrics
// =============================================================================

/// Active WebSocket connections.
pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "relay_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

/// Total WebSocket connections (cumulative).
pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "relay_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// WebSocket messages sent by type.
pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("relay_ws_messages_sent_total", "WebSocket messages sent"),
        &["type"],
    )
    .unwrap()
});

/// Client frames that could not be parsed.
pub static WS_INVALID_FRAMES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "relay_ws_invalid_frames_total",
        "WebSocket client frames that could not be parsed",
    )
    .unwrap()
});

// =============================================================================
// Relay State (collected dynamically)
// =============================================================================

/// Current status, one series per status set to 1 or 0.
pub static RELAY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("relay_status", "Current relay status (1 = active)"),
        &["status"],
    )
    .unwrap()
});

/// Whether the poller thread is running.
pub static RELAY_CONSUMING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "relay_consuming",
        "Whether the partition poller is running (1) or not (0)",
    )
    .unwrap()
});

pub static RELAY_SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("relay_subscribers", "Number of connected event subscribers").unwrap()
});

pub static RELAY_PENDING_CHECKPOINTS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "relay_pending_checkpoints",
        "Steps whose offset waits for a checkpoint",
    )
    .unwrap()
});

pub static RELAY_KM_TRAVELLED: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "relay_km_travelled",
        "Aggregate mileage of instructions consumed since the last reset",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // WebSocket
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_MESSAGES_SENT.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_INVALID_FRAMES.clone()))
        .unwrap();

    // Relay state
    registry.register(Box::new(RELAY_STATUS.clone())).unwrap();
    registry
        .register(Box::new(RELAY_CONSUMING.clone()))
        .unwrap();
    registry
        .register(Box::new(RELAY_SUBSCRIBERS.clone()))
        .unwrap();
    registry
        .register(Box::new(RELAY_PENDING_CHECKPOINTS.clone()))
        .unwrap();
    registry
        .register(Box::new(RELAY_KM_TRAVELLED.clone()))
        .unwrap();

    // Core metrics (poller, checkpoints, bridge)
    for metric in relay_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Refresh the relay gauges from the service's current stats.
pub fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let stats = state.service().stats();

    for status in [
        ServiceStatus::Idle,
        ServiceStatus::Ready,
        ServiceStatus::Driving,
        ServiceStatus::Completed,
    ] {
        RELAY_STATUS
            .with_label_values(&[status.as_str()])
            .set(i64::from(stats.status == status));
    }
    RELAY_CONSUMING.set(i64::from(stats.consuming));
    RELAY_SUBSCRIBERS.set(stats.subscribers as i64);
    RELAY_PENDING_CHECKPOINTS.set(stats.pending_checkpoints as i64);
    RELAY_KM_TRAVELLED.set(stats.total_km_travelled);
}
