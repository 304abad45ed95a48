//! Consumer-side chunk stream registry.
//!
//! A per-request table mapping a chunk id to a single-writer single-reader
//! queue. An entry is created on first reference from either side: the
//! dehydration walker attaching a handle, or the background reader
//! delivering an update for an id it has not seen yet (order between the
//! head parse and subsequent updates is the only ordering guarantee on the
//! wire). An entry is destroyed once its terminal event has been delivered
//! and consumed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::protocol::{ChunkId, RawUpdate};

/// One event on a chunk's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    Update(RawUpdate),
    /// Synthetic event injected when the transport ended or was aborted
    /// before this chunk reached a terminal state.
    Interrupted,
}

struct Slot {
    tx: mpsc::UnboundedSender<ChunkEvent>,
    /// Present until a handle attaches. Updates delivered before the
    /// attach sit buffered in the channel.
    rx: Option<mpsc::UnboundedReceiver<ChunkEvent>>,
    /// True once any update has been queued. Close keeps such entries so
    /// a late attach can still drain them.
    delivered: bool,
}

struct Inner {
    slots: HashMap<ChunkId, Slot>,
    closed: bool,
}

/// Shared handle to the registry. Scoped to exactly one request; discarded
/// at its end.
#[derive(Clone)]
pub struct ChunkRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Take the read side of the chunk's queue, creating the entry if the
    /// id has not been referenced yet.
    pub(crate) fn attach(&self, id: ChunkId) -> mpsc::UnboundedReceiver<ChunkEvent> {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.get_mut(&id) {
            if let Some(rx) = slot.rx.take() {
                return rx;
            }
            // A second handle for the same id is a producer bug; hand it a
            // queue that terminates immediately.
            tracing::warn!(id, "duplicate attach for chunk");
            return interrupted_queue();
        }
        if inner.closed {
            return interrupted_queue();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.slots.insert(id, Slot { tx, rx: None, delivered: false });
        rx
    }

    /// Forward one wire record to its chunk's queue, creating the entry on
    /// demand when the id is referenced before hydration has run.
    pub(crate) fn deliver(&self, update: RawUpdate) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        let slot = inner.slots.entry(update.id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Slot { tx, rx: Some(rx), delivered: false }
        });
        slot.delivered = true;
        let _ = slot.tx.send(ChunkEvent::Update(update));
    }

    /// Drop the entry once its terminal event has been consumed.
    /// Idempotent: handles release on terminal delivery and again on drop.
    pub(crate) fn release(&self, id: ChunkId) {
        self.lock().slots.remove(&id);
    }

    /// Deliver the synthetic interrupted event to every still-open entry.
    /// Unattached entries with nothing buffered are dropped outright --
    /// nobody can observe them. Unattached entries holding undrained
    /// updates stay: handles attach lazily (a nested chunk is attached
    /// only when its parent is resolved), which may happen after the
    /// stream has closed, and its buffered events are still consumable.
    pub(crate) fn interrupt_all(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.slots.retain(|_, slot| {
            if slot.rx.is_some() && !slot.delivered {
                return false;
            }
            let _ = slot.tx.send(ChunkEvent::Interrupted);
            true
        });
    }

    /// Number of live entries, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRegistry")
            .field("len", &self.len())
            .finish()
    }
}

fn interrupted_queue() -> mpsc::UnboundedReceiver<ChunkEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(ChunkEvent::Interrupted);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: ChunkId, status: u64) -> RawUpdate {
        RawUpdate { id, status, value: None }
    }

    #[tokio::test]
    async fn test_deliver_before_attach_is_buffered() {
        let registry = ChunkRegistry::new();
        registry.deliver(update(3, 1));
        registry.deliver(update(3, 0));

        let mut rx = registry.attach(3);
        assert_eq!(rx.recv().await, Some(ChunkEvent::Update(update(3, 1))));
        assert_eq!(rx.recv().await, Some(ChunkEvent::Update(update(3, 0))));
    }

    #[tokio::test]
    async fn test_interrupt_reaches_every_open_entry() {
        let registry = ChunkRegistry::new();
        let mut attached = registry.attach(0);
        let _empty = registry.attach(1); // attached but nothing delivered
        drop(registry.attach(2));

        registry.interrupt_all();
        assert_eq!(attached.recv().await, Some(ChunkEvent::Interrupted));

        registry.release(0);
        registry.release(1);
        registry.release(2);
        assert!(registry.is_empty());

        // Late references to unknown ids after close terminate immediately.
        let mut late = registry.attach(9);
        assert_eq!(late.recv().await, Some(ChunkEvent::Interrupted));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_buffered_events_survive_close() {
        let registry = ChunkRegistry::new();
        registry.deliver(update(2, 0));
        registry.interrupt_all();
        assert_eq!(registry.len(), 1);

        // A handle attaching after the close still drains the buffered
        // update, then observes the interruption marker.
        let mut rx = registry.attach(2);
        assert_eq!(rx.recv().await, Some(ChunkEvent::Update(update(2, 0))));
        assert_eq!(rx.recv().await, Some(ChunkEvent::Interrupted));
    }

    #[tokio::test]
    async fn test_deliver_after_close_is_dropped() {
        let registry = ChunkRegistry::new();
        registry.interrupt_all();
        registry.deliver(update(5, 0));
        assert!(registry.is_empty());
    }
}
