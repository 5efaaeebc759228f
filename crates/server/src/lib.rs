//! HTTP and WebSocket surface of the instruction relay.

pub mod api;
pub mod metrics;
pub mod state;
