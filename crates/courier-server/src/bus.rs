//! Cross-instance publish/subscribe.
//!
//! Multiple service instances converge on a consistent delivery and presence
//! view by republishing every broadcast on the bus.  Events carry the
//! originating instance id so a node can skip its own publications.  The
//! in-memory implementation covers single-instance deployments and tests;
//! any networked pub/sub backend can stand behind the same trait.

use tokio::sync::broadcast;

use courier_shared::{ServerFrame, UserId};

/// One event on the cross-instance bus.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Instance that produced the event.
    pub origin: String,
    /// Topic, e.g. `conversation:<uuid>` or `presence`.
    pub topic: String,
    /// Users the frame should reach.
    pub recipients: Vec<UserId>,
    pub frame: ServerFrame,
}

/// Publish/subscribe seam between service instances.
pub trait Bus: Send + Sync {
    fn publish(&self, event: BusEvent);
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// Process-local bus over a tokio broadcast channel.
pub struct MemoryBus {
    tx: broadcast::Sender<BusEvent>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Bus for MemoryBus {
    fn publish(&self, event: BusEvent) {
        // No subscribers is fine: single-instance deployments run without a
        // sibling delivery task.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
