//! In-process session event bus.
//!
//! The engine assumes an ordered, at-least-once event bus with a global
//! monotonically increasing event id; this module provides the in-process
//! realization used for local wiring and tests. Publishing stamps the
//! envelope with the next event id and fans it out to every attached
//! participant over a tokio broadcast channel; each participant gets an
//! independent receiver and consumes at its own pace.
//!
//! All participants receive all messages, including their own — filtering
//! self-originated messages is the session client's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{BusEvent, Envelope};

/// Counters for bus health, lock-free on the publish path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
}

/// One logical channel scoped to a collaboration session.
pub struct LocalBus {
    sender: broadcast::Sender<BusEvent>,
    next_event_id: Arc<AtomicU64>,
    capacity: usize,
}

impl LocalBus {
    /// `capacity` bounds how many events a lagging receiver may buffer
    /// before it starts reporting loss.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_event_id: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Attach a participant; the receiver sees every event published after
    /// this call.
    pub fn attach(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// A cloneable publish handle for one participant.
    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            sender: self.sender.clone(),
            next_event_id: Arc::clone(&self.next_event_id),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.next_event_id.load(Ordering::Relaxed),
        }
    }
}

/// Publishes envelopes onto the session channel, assigning event ids.
#[derive(Clone)]
pub struct BusPublisher {
    sender: broadcast::Sender<BusEvent>,
    next_event_id: Arc<AtomicU64>,
}

impl BusPublisher {
    /// Stamp and publish. Returns the assigned event id; ids start at 1 and
    /// are strictly increasing across all publishers of the same bus.
    pub fn publish(&self, envelope: Envelope) -> u64 {
        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1;
        let event = BusEvent { event_id, envelope };
        // No receivers is fine: a lone host before anyone joins.
        let _ = self.sender.send(event);
        event_id
    }
}
