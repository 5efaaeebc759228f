//! The relay engine.
//!
//! Moves instructions from a broker partition to live subscribers and feeds
//! checkpoint acknowledgments back so that offsets are committed only once
//! the instruction's effect is confirmed:
//!
//! ```text
//! poller thread ──decode──▶ bridge ──▶ dispatcher (runtime) ──▶ hub ──▶ subscribers
//!      ▲                                   │
//!      └──── commit request ◀── checkpoint registry ◀── checkpoint produced
//! ```

mod bridge;
mod checkpoint;
mod fanout;
mod poller;
mod producer;
mod run;
mod service;
mod status;
mod types;

pub use bridge::{create_bridge, Bridge, Dispatcher, EventHandler, RelayEvent, Submission};
pub use checkpoint::{
    CheckpointError, CheckpointRegistry, CommitRequest, Committer, SignalOutcome,
};
pub use fanout::{Hub, RelayMessage};
pub use producer::{create_producer_lane, ProducerLane, ProducerWorker};
pub use run::{RunCounter, RunToken};
pub use service::{create_relay_service, start_relay_service, RelayService, RelayWorkers};
pub use status::{ReadyClaim, ServiceStatus, StatusError, StatusMachine};
pub use types::{
    relay_line, ActionResponse, ConnectivityReport, ConnectivityStage, RelayError, RelayStats,
};
