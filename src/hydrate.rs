//! Producer-side hydration walker.
//!
//! Recursively inspects a value tree, replacing every deferred value or
//! async sequence with the placeholder plus a chunk definition, and spawns
//! one task per chunk that feeds update records into the session's shared
//! bounded output channel as data becomes available. Tasks suspend on a
//! full channel, so the transport paces the sources.
//!
//! The session owns the chunk-id counter and is scoped to exactly one
//! request. The "pending set" is realized through sender-drop semantics:
//! every chunk task holds a clone of the update sender, so the channel
//! closes exactly when the head walk is complete and the last task has
//! finished -- it cannot close while chunks are still in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::MaxDepthError;
use crate::protocol::{ChunkDef, ChunkId, ChunkKind, ChunkUpdate, Head, HydratedValue, PLACEHOLDER};
use crate::value::{BoxDeferred, BoxSequence, StreamValue};

/// Side channel reporting every producer-side failure (rejection, sequence
/// throw, depth violation) with the offending path. Fires independently of
/// whether the consumer is still attached; the error itself never crosses
/// the wire.
pub type OnError = Arc<dyn Fn(&anyhow::Error, &[String]) + Send + Sync>;

/// Bound on in-flight update records. Chunk tasks suspend on a full
/// channel, so a fast source cannot outrun a slow transport.
pub(crate) const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub(crate) struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    counter: AtomicU64,
    tx: mpsc::Sender<ChunkUpdate>,
    max_depth: Option<usize>,
    on_error: Option<OnError>,
}

impl Session {
    pub fn new(
        max_depth: Option<usize>,
        on_error: Option<OnError>,
    ) -> (Self, mpsc::Receiver<ChunkUpdate>) {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let session = Self {
            inner: Arc::new(SessionInner {
                counter: AtomicU64::new(0),
                tx,
                max_depth,
                on_error,
            }),
        };
        (session, rx)
    }

    fn next_id(&self) -> ChunkId {
        self.inner.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Suspends while the channel is full. False once the output stream
    /// has been dropped; chunk tasks use that as their signal to stop
    /// producing.
    async fn send(&self, update: ChunkUpdate) -> bool {
        self.inner.tx.send(update).await.is_ok()
    }

    fn report(&self, error: &anyhow::Error, path: &[String]) {
        tracing::debug!(path = path.join("."), %error, "producer chunk failed");
        if let Some(on_error) = &self.inner.on_error {
            on_error(error, path);
        }
    }

    fn depth_exceeded(&self, path: &[String]) -> bool {
        self.inner.max_depth.is_some_and(|max| path.len() > max)
    }

    /// Hydrate the top-level mapping into the head.
    pub fn hydrate_root(&self, data: Vec<(String, StreamValue)>) -> Head {
        let mut head = Head::default();
        for (slot, value) in data {
            let path = vec![slot.clone()];
            head.slots.insert(slot, self.hydrate(value, &path));
        }
        head
    }

    /// Hydrate one value-tree node at `path`.
    pub fn hydrate(&self, value: StreamValue, path: &[String]) -> HydratedValue {
        match value {
            StreamValue::Plain(data) => HydratedValue::plain(data),
            StreamValue::Deferred(future) => self.whole_node(
                ChunkKind::Deferred,
                self.register_deferred(future, path.to_vec()),
            ),
            StreamValue::Sequence(stream) => self.whole_node(
                ChunkKind::Sequence,
                self.register_sequence(stream, path.to_vec()),
            ),
            StreamValue::Object(entries) => {
                let mut data = Map::new();
                let mut defs = Vec::new();
                for (key, item) in entries {
                    let (value, def) = self.hydrate_member(key.clone(), item, path);
                    data.insert(key, value);
                    defs.extend(def);
                }
                HydratedValue {
                    data: Some(Value::Object(data)),
                    defs,
                }
            }
            StreamValue::Array(elements) => {
                let mut data = Vec::with_capacity(elements.len());
                let mut defs = Vec::new();
                for (index, item) in elements.into_iter().enumerate() {
                    let (value, def) = self.hydrate_member(index.to_string(), item, path);
                    data.push(value);
                    defs.extend(def);
                }
                HydratedValue {
                    data: Some(Value::Array(data)),
                    defs,
                }
            }
        }
    }

    /// Hydrate one direct member of a container node. Array elements are
    /// keyed by their decimal index.
    fn hydrate_member(
        &self,
        key: String,
        item: StreamValue,
        parent: &[String],
    ) -> (Value, Option<ChunkDef>) {
        let mut path = parent.to_vec();
        path.push(key.clone());
        match item {
            StreamValue::Plain(v) => (v, None),
            StreamValue::Deferred(future) => {
                let id = self.register_deferred(future, path);
                (
                    Value::from(PLACEHOLDER),
                    Some(ChunkDef {
                        key: Some(key),
                        kind: ChunkKind::Deferred,
                        id,
                    }),
                )
            }
            StreamValue::Sequence(stream) => {
                let id = self.register_sequence(stream, path);
                (
                    Value::from(PLACEHOLDER),
                    Some(ChunkDef {
                        key: Some(key),
                        kind: ChunkKind::Sequence,
                        id,
                    }),
                )
            }
            container @ (StreamValue::Object(_) | StreamValue::Array(_)) => {
                if container.has_async() {
                    // Wire defs address direct members only, so a deeper
                    // async value is hoisted behind an immediately-fulfilled
                    // deferred chunk.
                    let id = self.register_deferred(Box::pin(async move { Ok(container) }), path);
                    (
                        Value::from(PLACEHOLDER),
                        Some(ChunkDef {
                            key: Some(key),
                            kind: ChunkKind::Deferred,
                            id,
                        }),
                    )
                } else {
                    (container.into_plain(), None)
                }
            }
        }
    }

    fn whole_node(&self, kind: ChunkKind, id: ChunkId) -> HydratedValue {
        HydratedValue {
            data: Some(Value::from(PLACEHOLDER)),
            defs: vec![ChunkDef { key: None, kind, id }],
        }
    }

    fn register_deferred(&self, future: BoxDeferred, path: Vec<String>) -> ChunkId {
        let id = self.next_id();
        let session = self.clone();
        tokio::spawn(async move {
            if session.depth_exceeded(&path) {
                let error = anyhow::Error::new(MaxDepthError { path: path.clone() });
                session.report(&error, &path);
                session.send(ChunkUpdate::Rejected { id }).await;
                return;
            }
            match future.await {
                Ok(value) => {
                    let hydrated = session.hydrate(value, &path);
                    session.send(ChunkUpdate::Fulfilled { id, value: hydrated }).await;
                }
                Err(error) => {
                    session.report(&error, &path);
                    session.send(ChunkUpdate::Rejected { id }).await;
                }
            }
        });
        id
    }

    fn register_sequence(&self, stream: BoxSequence, path: Vec<String>) -> ChunkId {
        let id = self.next_id();
        let session = self.clone();
        tokio::spawn(async move {
            if session.depth_exceeded(&path) {
                let error = anyhow::Error::new(MaxDepthError { path: path.clone() });
                session.report(&error, &path);
                session.send(ChunkUpdate::Error { id }).await;
                return;
            }
            let mut stream = stream;
            loop {
                match stream.next().await {
                    Some(Ok(value)) => {
                        let hydrated = session.hydrate(value, &path);
                        if !session.send(ChunkUpdate::Item { id, value: hydrated }).await {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        session.report(&error, &path);
                        session.send(ChunkUpdate::Error { id }).await;
                        return;
                    }
                    None => {
                        session.send(ChunkUpdate::Done { id }).await;
                        return;
                    }
                }
            }
        });
        id
    }
}
