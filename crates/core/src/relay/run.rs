//! Consumption run numbering.
//!
//! Every stop or reset starts a new run. Work queued by the poller is tagged
//! with the run it belongs to and discarded once that run is over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RunCounter {
    current: Arc<AtomicU64>,
}

impl RunCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// End the current run. Returns the new run number.
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, run: u64) -> bool {
        self.current() == run
    }

    /// Token for `run`, checkable from any thread.
    pub fn token(&self, run: u64) -> RunToken {
        RunToken {
            counter: self.clone(),
            run,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunToken {
    counter: RunCounter,
    run: u64,
}

impl RunToken {
    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn is_current(&self) -> bool {
        self.counter.is_current(self.run)
    }
}
