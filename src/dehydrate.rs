//! Consumer-side dehydration walker and live handles.
//!
//! Inverse of the hydration walker: reconstructs the plain data node and,
//! for every chunk definition attached to it, patches the placeholder with
//! a live handle backed by the matching registry entry. Patching is
//! functional -- the parsed snapshot is rebuilt by path, never mutated in
//! place.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ChunkError;
use crate::protocol::{
    ChunkDef, ChunkId, ChunkKind, HydratedValue, RawUpdate, DEFERRED_STATUS_FULFILLED,
    DEFERRED_STATUS_REJECTED, SEQUENCE_STATUS_DONE, SEQUENCE_STATUS_ERROR, SEQUENCE_STATUS_VALUE,
};
use crate::registry::{ChunkEvent, ChunkRegistry};

/// Caller-visible value tree: plain data with live handles spliced in
/// where the producer registered chunks.
#[derive(Debug)]
pub enum DehydratedValue {
    Plain(Value),
    Object(BTreeMap<String, DehydratedValue>),
    Array(Vec<DehydratedValue>),
    Deferred(DeferredHandle),
    Sequence(SequenceHandle),
}

impl DehydratedValue {
    pub fn as_plain(&self) -> Option<&Value> {
        match self {
            Self::Plain(v) => Some(v),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DehydratedValue> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Move a member out of an object node, e.g. to consume its handle.
    pub fn remove(&mut self, key: &str) -> Option<DehydratedValue> {
        match self {
            Self::Object(map) => map.remove(key),
            _ => None,
        }
    }

    pub fn get_index(&self, index: usize) -> Option<&DehydratedValue> {
        match self {
            Self::Array(elements) => elements.get(index),
            _ => None,
        }
    }

    /// Move an element out of an array node, leaving null in its place so
    /// sibling indices stay valid.
    pub fn take_index(&mut self, index: usize) -> Option<DehydratedValue> {
        match self {
            Self::Array(elements) => elements
                .get_mut(index)
                .map(|slot| std::mem::replace(slot, Self::Plain(Value::Null))),
            _ => None,
        }
    }

    pub fn into_deferred(self) -> Option<DeferredHandle> {
        match self {
            Self::Deferred(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_sequence(self) -> Option<SequenceHandle> {
        match self {
            Self::Sequence(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Rebuild the caller-visible value from one wire node.
pub(crate) fn dehydrate(value: HydratedValue, registry: &ChunkRegistry) -> DehydratedValue {
    let HydratedValue { data, defs } = value;

    // Whole-node replacement.
    if let Some(def) = defs.iter().find(|d| d.key.is_none()) {
        return handle_for(def, registry);
    }

    let data = data.unwrap_or(Value::Null);
    if defs.is_empty() {
        return DehydratedValue::Plain(data);
    }

    match data {
        Value::Object(map) => {
            let mut object: BTreeMap<String, DehydratedValue> = map
                .into_iter()
                .map(|(k, v)| (k, DehydratedValue::Plain(v)))
                .collect();
            for def in &defs {
                if let Some(key) = &def.key {
                    object.insert(key.clone(), handle_for(def, registry));
                }
            }
            DehydratedValue::Object(object)
        }
        Value::Array(elements) => {
            let mut elements: Vec<DehydratedValue> =
                elements.into_iter().map(DehydratedValue::Plain).collect();
            for def in &defs {
                let Some(key) = &def.key else { continue };
                match key.parse::<usize>() {
                    Ok(index) if index < elements.len() => {
                        elements[index] = handle_for(def, registry);
                    }
                    _ => {
                        tracing::warn!(
                            key = key.as_str(),
                            id = def.id,
                            "chunk definition key addresses no array element"
                        );
                    }
                }
            }
            DehydratedValue::Array(elements)
        }
        other => {
            tracing::warn!("keyed chunk definitions target a non-container node");
            DehydratedValue::Plain(other)
        }
    }
}

fn handle_for(def: &ChunkDef, registry: &ChunkRegistry) -> DehydratedValue {
    let rx = registry.attach(def.id);
    match def.kind {
        ChunkKind::Deferred => DehydratedValue::Deferred(DeferredHandle {
            id: def.id,
            rx,
            registry: registry.clone(),
        }),
        ChunkKind::Sequence => DehydratedValue::Sequence(SequenceHandle {
            id: def.id,
            rx,
            registry: registry.clone(),
            done: false,
        }),
    }
}

// =============================================================================
// Deferred handle
// =============================================================================

/// Live handle for a deferred chunk. Resolving reads exactly one event off
/// the chunk's queue; dropping without resolving releases the queue.
#[derive(Debug)]
pub struct DeferredHandle {
    id: ChunkId,
    rx: mpsc::UnboundedReceiver<ChunkEvent>,
    registry: ChunkRegistry,
}

impl DeferredHandle {
    pub async fn resolve(mut self) -> Result<DehydratedValue, ChunkError> {
        match self.rx.recv().await {
            Some(ChunkEvent::Update(update)) => interpret_deferred(update, &self.registry),
            Some(ChunkEvent::Interrupted) | None => Err(ChunkError::Interrupted),
        }
        // `self` drops here, releasing the registry entry.
    }
}

impl Drop for DeferredHandle {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

fn interpret_deferred(
    update: RawUpdate,
    registry: &ChunkRegistry,
) -> Result<DehydratedValue, ChunkError> {
    match (update.status, update.value) {
        (DEFERRED_STATUS_FULFILLED, Some(value)) => Ok(dehydrate(value, registry)),
        (DEFERRED_STATUS_REJECTED, _) => Err(ChunkError::Remote),
        (status, _) => {
            tracing::warn!(id = update.id, status, "malformed deferred update");
            Err(ChunkError::Interrupted)
        }
    }
}

// =============================================================================
// Sequence handle
// =============================================================================

/// Live handle for an async-sequence chunk. One event is read per
/// iteration step until `Done` (clean stop) or `Error`/interruption (one
/// final `Err` item). The registry entry is released on any terminal event
/// and on drop, so breaking out of a consuming loop early cannot leak it.
#[derive(Debug)]
pub struct SequenceHandle {
    id: ChunkId,
    rx: mpsc::UnboundedReceiver<ChunkEvent>,
    registry: ChunkRegistry,
    done: bool,
}

impl SequenceHandle {
    fn finish(&mut self) {
        self.done = true;
        self.registry.release(self.id);
    }
}

impl Stream for SequenceHandle {
    type Item = Result<DehydratedValue, ChunkError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(ChunkEvent::Update(update))) => match update.status {
                SEQUENCE_STATUS_VALUE => match update.value {
                    Some(value) => {
                        Poll::Ready(Some(Ok(dehydrate(value, &this.registry))))
                    }
                    None => {
                        tracing::warn!(id = this.id, "sequence item without a value");
                        this.finish();
                        Poll::Ready(Some(Err(ChunkError::Interrupted)))
                    }
                },
                SEQUENCE_STATUS_DONE => {
                    this.finish();
                    Poll::Ready(None)
                }
                SEQUENCE_STATUS_ERROR => {
                    this.finish();
                    Poll::Ready(Some(Err(ChunkError::Remote)))
                }
                status => {
                    tracing::warn!(id = this.id, status, "malformed sequence update");
                    this.finish();
                    Poll::Ready(Some(Err(ChunkError::Interrupted)))
                }
            },
            Poll::Ready(Some(ChunkEvent::Interrupted)) | Poll::Ready(None) => {
                this.finish();
                Poll::Ready(Some(Err(ChunkError::Interrupted)))
            }
        }
    }
}

impl Drop for SequenceHandle {
    fn drop(&mut self) {
        if !self.done {
            self.registry.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn plain_update(id: ChunkId, status: u64, data: Value) -> RawUpdate {
        RawUpdate {
            id,
            status,
            value: Some(HydratedValue::plain(data)),
        }
    }

    #[tokio::test]
    async fn test_deferred_resolves_and_releases() {
        let registry = ChunkRegistry::new();
        let hydrated = HydratedValue {
            data: Some(json!(0)),
            defs: vec![ChunkDef { key: None, kind: ChunkKind::Deferred, id: 0 }],
        };
        let handle = match dehydrate(hydrated, &registry) {
            DehydratedValue::Deferred(h) => h,
            other => panic!("expected deferred, got {other:?}"),
        };
        registry.deliver(plain_update(0, DEFERRED_STATUS_FULFILLED, json!("v")));

        let resolved = handle.resolve().await.unwrap();
        assert_eq!(resolved.as_plain(), Some(&json!("v")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_keyed_defs_patch_the_snapshot() {
        let registry = ChunkRegistry::new();
        let hydrated = HydratedValue {
            data: Some(json!({"name": "n", "later": 0})),
            defs: vec![ChunkDef {
                key: Some("later".to_string()),
                kind: ChunkKind::Sequence,
                id: 4,
            }],
        };
        let mut value = dehydrate(hydrated, &registry);
        assert_eq!(value.get("name").and_then(|v| v.as_plain()), Some(&json!("n")));
        assert!(matches!(
            value.remove("later"),
            Some(DehydratedValue::Sequence(_))
        ));
    }

    #[tokio::test]
    async fn test_numeric_keys_patch_array_elements() {
        let registry = ChunkRegistry::new();
        let hydrated = HydratedValue {
            data: Some(json!(["first", 0, "third"])),
            defs: vec![ChunkDef {
                key: Some("1".to_string()),
                kind: ChunkKind::Deferred,
                id: 6,
            }],
        };
        let mut value = dehydrate(hydrated, &registry);
        assert_eq!(
            value.get_index(0).and_then(|v| v.as_plain()),
            Some(&json!("first"))
        );
        assert_eq!(
            value.get_index(2).and_then(|v| v.as_plain()),
            Some(&json!("third"))
        );

        let handle = value.take_index(1).unwrap().into_deferred().unwrap();
        registry.deliver(plain_update(6, DEFERRED_STATUS_FULFILLED, json!("second")));
        let resolved = handle.resolve().await.unwrap();
        assert_eq!(resolved.as_plain(), Some(&json!("second")));
    }

    #[tokio::test]
    async fn test_sequence_stops_after_done() {
        let registry = ChunkRegistry::new();
        let mut handle = match handle_for(
            &ChunkDef { key: None, kind: ChunkKind::Sequence, id: 1 },
            &registry,
        ) {
            DehydratedValue::Sequence(h) => h,
            other => panic!("expected sequence, got {other:?}"),
        };
        registry.deliver(plain_update(1, SEQUENCE_STATUS_VALUE, json!(1)));
        registry.deliver(RawUpdate { id: 1, status: SEQUENCE_STATUS_DONE, value: None });

        let first = handle.next().await.unwrap().unwrap();
        assert_eq!(first.as_plain(), Some(&json!(1)));
        assert!(handle.next().await.is_none());
        assert!(handle.next().await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_sequence_releases_entry() {
        let registry = ChunkRegistry::new();
        let handle = handle_for(
            &ChunkDef { key: None, kind: ChunkKind::Sequence, id: 2 },
            &registry,
        );
        assert_eq!(registry.len(), 1);
        drop(handle);
        assert!(registry.is_empty());
    }
}
