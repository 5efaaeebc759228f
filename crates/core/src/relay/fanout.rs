//! Fan-out of relay events to live subscribers.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::RelayStats;
use crate::messages::Instruction;
use crate::metrics;

/// Event pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Instruction { data: Instruction },
    Log { message: String },
    Status { data: RelayStats },
    Pong { data: RelayStats },
}

impl RelayMessage {
    /// The `type` tag, for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Instruction { .. } => "instruction",
            RelayMessage::Log { .. } => "log",
            RelayMessage::Status { .. } => "status",
            RelayMessage::Pong { .. } => "pong",
        }
    }
}

struct Subscriber {
    id: Uuid,
    sink: mpsc::Sender<RelayMessage>,
    /// Events skipped since the subscriber last had room.
    skipped: u64,
}

impl Subscriber {
    /// Queue `message`. Returns false once the receiving side is gone.
    fn deliver(&mut self, message: RelayMessage) -> bool {
        match self.sink.try_send(message) {
            Ok(()) => {
                if self.skipped > 0 {
                    debug!(
                        "Subscriber {} caught up after skipping {} event(s)",
                        self.id, self.skipped
                    );
                    self.skipped = 0;
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                if self.skipped == 0 {
                    warn!("Subscriber {} lagging, skipping events", self.id);
                }
                self.skipped += 1;
                metrics::SUBSCRIBER_EVENTS_SKIPPED.inc();
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Dropping subscriber {}: receiver closed", self.id);
                false
            }
        }
    }
}

/// Ordered set of subscribers.
///
/// Each subscriber gets a bounded queue. While a subscriber's queue is full
/// it misses events but stays connected; it is removed only once its
/// receiver is closed.
pub struct Hub {
    subscribers: Mutex<Vec<Subscriber>>,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber and return its id and event stream.
    pub fn connect(&self) -> (Uuid, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.lock().push(Subscriber {
            id,
            sink: tx,
            skipped: 0,
        });
        debug!("Subscriber {} connected", id);
        (id, rx)
    }

    /// Remove a subscriber. Returns false if it was not connected.
    pub fn disconnect(&self, id: Uuid) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            debug!("Subscriber {} disconnected", id);
        }
        removed
    }

    /// Send `message` to every subscriber. Returns how many are still
    /// connected afterwards.
    pub fn broadcast(&self, message: &RelayMessage) -> usize {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain_mut(|s| s.deliver(message.clone()));
        let remaining = subscribers.len();
        if remaining != before {
            debug!("Removed {} closed subscriber(s)", before - remaining);
        }
        remaining
    }

    /// Send `message` to a single subscriber. Returns false if it is not
    /// connected.
    pub fn send_to(&self, id: Uuid, message: RelayMessage) -> bool {
        let mut subscribers = self.lock();
        let Some(index) = subscribers.iter().position(|s| s.id == id) else {
            return false;
        };
        if !subscribers[index].deliver(message) {
            subscribers.remove(index);
            return false;
        }
        true
    }

    /// Events skipped for `id` since it last had room in its queue.
    pub fn skipped(&self, id: Uuid) -> Option<u64> {
        self.lock().iter().find(|s| s.id == id).map(|s| s.skipped)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(message: &str) -> RelayMessage {
        RelayMessage::Log {
            message: message.to_string(),
        }
    }

    #[test]
    fn test_broadcast_reaches_all_in_order() {
        let hub = Hub::new(8);
        let (_, mut a) = hub.connect();
        let (_, mut b) = hub.connect();

        assert_eq!(hub.broadcast(&log("one")), 2);
        assert_eq!(hub.broadcast(&log("two")), 2);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap(), log("one"));
            assert_eq!(rx.try_recv().unwrap(), log("two"));
        }
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let hub = Hub::new(8);
        let (_, alive) = hub.connect();
        let (_, dead) = hub.connect();
        drop(dead);

        assert_eq!(hub.broadcast(&log("hello")), 1);
        assert_eq!(hub.len(), 1);
        drop(alive);
    }

    #[test]
    fn test_full_subscriber_skips_but_stays_connected() {
        let hub = Hub::new(1);
        let (slow_id, mut slow) = hub.connect();
        let (_, mut fast) = hub.connect();

        assert_eq!(hub.broadcast(&log("first")), 2);
        fast.try_recv().unwrap();

        // `slow` has not drained, so its queue is full.
        assert_eq!(hub.broadcast(&log("second")), 2);
        assert_eq!(fast.try_recv().unwrap(), log("second"));
        assert_eq!(hub.skipped(slow_id), Some(1));
        assert_eq!(hub.len(), 2);

        assert_eq!(slow.try_recv().unwrap(), log("first"));
        assert_eq!(hub.broadcast(&log("third")), 2);
        assert_eq!(slow.try_recv().unwrap(), log("third"));
        assert_eq!(hub.skipped(slow_id), Some(0));
    }

    #[test]
    fn test_send_to_full_subscriber_keeps_it() {
        let hub = Hub::new(1);
        let (id, mut rx) = hub.connect();

        assert!(hub.send_to(id, log("one")));
        assert!(hub.send_to(id, log("two")));
        assert_eq!(hub.len(), 1);

        assert_eq!(rx.try_recv().unwrap(), log("one"));
        assert!(hub.send_to(id, log("three")));
        assert_eq!(rx.try_recv().unwrap(), log("three"));
    }

    #[test]
    fn test_send_to_closed_subscriber_removes_it() {
        let hub = Hub::new(4);
        let (id, rx) = hub.connect();
        drop(rx);

        assert!(!hub.send_to(id, log("gone")));
        assert!(hub.is_empty());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let hub = Hub::new(8);
        let (id, _rx) = hub.connect();

        assert!(hub.disconnect(id));
        assert!(!hub.disconnect(id));
        assert!(hub.is_empty());
    }

    #[test]
    fn test_send_to_single_subscriber() {
        let hub = Hub::new(8);
        let (a, mut rx_a) = hub.connect();
        let (_, mut rx_b) = hub.connect();

        assert!(hub.send_to(a, log("only a")));
        assert_eq!(rx_a.try_recv().unwrap(), log("only a"));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_value(log("[12:00:00] hi")).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["message"], "[12:00:00] hi");
    }
}
