//! Server-sent-events variant.
//!
//! The same value model reframed for a single top-level async sequence: no
//! chunk registry, one event record per item, each carrying a strictly
//! increasing numeric id and a serialized payload. Resumption rides on the
//! transport's native reconnect behavior -- the consumer reconnects
//! supplying the last received event id, and the producer's data source
//! resumes emission from the next logical item.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Future, Stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::accumulate::LineAccumulator;
use crate::consume::DeserializeFn;
use crate::error::{ConsumeError, WireError};
use crate::produce::SerializeFn;

/// Event name used for keep-alive frames. Carries no data and is filtered
/// out by the consumer.
pub const PING_EVENT: &str = "ping";

/// Bound on formatted frames in flight; the source suspends when the
/// transport falls behind.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// One logical server-sent event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseEvent {
    /// Strictly increasing per stream. Assigned by the producer when the
    /// source leaves it out.
    pub id: Option<u64>,
    pub event: Option<String>,
    pub data: Option<Value>,
}

impl SseEvent {
    pub fn data(value: impl Into<Value>) -> Self {
        Self {
            data: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

// =============================================================================
// Producer
// =============================================================================

#[derive(Clone)]
pub struct SseProducerConfig {
    pub serialize: Option<SerializeFn>,
    /// Idle interval after which a keep-alive ping is emitted.
    pub ping_interval: Duration,
}

impl Default for SseProducerConfig {
    fn default() -> Self {
        Self {
            serialize: None,
            ping_interval: Duration::from_secs(1),
        }
    }
}

/// Reframe a single async sequence of events as an SSE byte stream.
///
/// Ids pass through when the source supplies them (non-increasing ids are
/// dropped with a warning) and are allocated as `last + 1` when it does
/// not. A source error aborts the stream; reconnection is the consumer's
/// job. Must be called from within a tokio runtime.
pub fn sse_produce<S>(events: S, config: SseProducerConfig) -> SseProducerStream
where
    S: Stream<Item = Result<SseEvent, anyhow::Error>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut events = Box::pin(events);
        let mut last_id: Option<u64> = None;
        loop {
            let next = tokio::select! {
                item = events.next() => item,
                _ = tokio::time::sleep(config.ping_interval) => {
                    let ping = SseEvent {
                        id: None,
                        event: Some(PING_EVENT.to_string()),
                        data: Some(Value::String(String::new())),
                    };
                    if tx.send(format_event(&ping, &None)).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            match next {
                Some(Ok(mut event)) => {
                    match event.id {
                        Some(id) if last_id.is_some_and(|last| id <= last) => {
                            tracing::warn!(id, "dropping event with non-increasing id");
                            continue;
                        }
                        Some(id) => last_id = Some(id),
                        None => {
                            let id = last_id.map_or(0, |last| last + 1);
                            event.id = Some(id);
                            last_id = Some(id);
                        }
                    }
                    if tx.send(format_event(&event, &config.serialize)).await.is_err() {
                        return;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "sse source failed, aborting stream");
                    return;
                }
                None => return,
            }
        }
    });
    SseProducerStream { rx }
}

/// Resumable entry point: hands the last received event id to the data
/// source so it can skip everything already delivered.
pub fn sse_resume<F, S>(
    source: F,
    last_event_id: Option<u64>,
    config: SseProducerConfig,
) -> SseProducerStream
where
    F: FnOnce(Option<u64>) -> S,
    S: Stream<Item = Result<SseEvent, anyhow::Error>> + Send + 'static,
{
    sse_produce(source(last_event_id), config)
}

fn format_event(event: &SseEvent, serialize: &Option<SerializeFn>) -> Bytes {
    let mut out = String::new();
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    if let Some(data) = &event.data {
        out.push_str("data: ");
        match data {
            // Keep-alive frames carry a literally empty data field.
            Value::String(s) if s.is_empty() => {}
            _ => {
                let value = match serialize {
                    Some(serialize) => serialize(data.clone()),
                    None => data.clone(),
                };
                out.push_str(&value.to_string());
            }
        }
        out.push('\n');
    }
    if let Some(id) = event.id {
        out.push_str("id: ");
        out.push_str(&id.to_string());
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

/// Formatted SSE byte stream.
pub struct SseProducerStream {
    rx: mpsc::Receiver<Bytes>,
}

impl SseProducerStream {
    pub async fn write_to<W>(mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = self.next().await {
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}

impl Stream for SseProducerStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

// =============================================================================
// Consumer
// =============================================================================

#[derive(Clone)]
pub struct SseConsumerConfig {
    pub deserialize: Option<DeserializeFn>,
    /// Reconnect on end-of-transport, supplying the last received event id
    /// to the connector. When false the stream ends at the first EOF.
    pub reconnect: bool,
}

impl Default for SseConsumerConfig {
    fn default() -> Self {
        Self {
            deserialize: None,
            reconnect: true,
        }
    }
}

/// Reconnecting SSE consumer.
///
/// `connect` is called with the last received event id (the value a
/// standard client would place in `Last-Event-Id`): `None` on the first
/// connect, `Some(id)` on every reconnect. A connector error ends the
/// stream with that error.
pub struct SseConsumer<R, C> {
    connect: C,
    config: SseConsumerConfig,
    transport: Option<R>,
    accumulator: LineAccumulator,
    parser: SseParser,
    ready: VecDeque<SseEvent>,
    last_event_id: Option<u64>,
    buf: Vec<u8>,
}

impl<R, C, Fut> SseConsumer<R, C>
where
    R: AsyncRead + Unpin,
    C: FnMut(Option<u64>) -> Fut,
    Fut: Future<Output = std::io::Result<R>>,
{
    pub fn new(connect: C, config: SseConsumerConfig) -> Self {
        Self {
            connect,
            config,
            transport: None,
            accumulator: LineAccumulator::new(),
            parser: SseParser::default(),
            ready: VecDeque::new(),
            last_event_id: None,
            buf: vec![0u8; 4096],
        }
    }

    /// Id of the last event whose frame carried one, kept across
    /// reconnects.
    pub fn last_event_id(&self) -> Option<u64> {
        self.last_event_id
    }

    /// Next data-carrying event. Keep-alive pings and dataless frames are
    /// filtered out (their ids still advance the resumption cursor).
    pub async fn next(&mut self) -> Option<Result<SseEvent, ConsumeError>> {
        loop {
            if let Some(mut event) = self.ready.pop_front() {
                if let Some(deserialize) = &self.config.deserialize {
                    if let Some(data) = event.data.take() {
                        event.data = Some(deserialize(data));
                    }
                }
                return Some(Ok(event));
            }

            if self.transport.is_none() {
                match (self.connect)(self.last_event_id).await {
                    Ok(transport) => {
                        self.transport = Some(transport);
                        self.accumulator = LineAccumulator::new();
                        self.parser = SseParser::default();
                    }
                    Err(error) => return Some(Err(error.into())),
                }
            }

            let n = match self.transport.as_mut() {
                Some(transport) => match transport.read(&mut self.buf).await {
                    Ok(n) => n,
                    Err(error) => return Some(Err(error.into())),
                },
                None => 0,
            };
            if n == 0 {
                self.transport = None;
                if !self.config.reconnect {
                    return None;
                }
                continue;
            }

            let lines = match self.accumulator.push(&self.buf[..n]) {
                Ok(lines) => lines,
                Err(error) => return Some(Err(error.into())),
            };
            for line in lines {
                if let Some(frame) = self.parser.feed_line(&line) {
                    if let Some(id) = frame.id {
                        self.last_event_id = Some(id);
                    }
                    match frame.into_event() {
                        Ok(Some(event)) => self.ready.push_back(event),
                        Ok(None) => {} // ping / dataless frame
                        Err(error) => return Some(Err(error.into())),
                    }
                }
            }
        }
    }
}

/// Accumulated fields of the frame currently being parsed.
#[derive(Debug, Default)]
struct SseParser {
    event: Option<String>,
    data: Vec<String>,
    id: Option<u64>,
}

#[derive(Debug)]
struct SseFrame {
    event: Option<String>,
    data: Option<String>,
    id: Option<u64>,
}

impl SseFrame {
    fn into_event(self) -> Result<Option<SseEvent>, WireError> {
        let Some(data) = self.data else {
            return Ok(None);
        };
        if data.is_empty() || self.event.as_deref() == Some(PING_EVENT) {
            return Ok(None);
        }
        let data: Value = serde_json::from_str(&data)?;
        Ok(Some(SseEvent {
            id: self.id,
            event: self.event,
            data: Some(data),
        }))
    }
}

impl SseParser {
    /// Feed one line; a blank line dispatches the accumulated frame.
    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() && self.id.is_none() {
                return None;
            }
            let frame = SseFrame {
                event: self.event.take(),
                data: if self.data.is_empty() {
                    None
                } else {
                    Some(self.data.join("\n"))
                },
                id: self.id.take(),
            };
            self.data.clear();
            return Some(frame);
        }
        // Comment lines are ignored.
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = value.parse().ok(),
            _ => {}
        }
        None
    }
}
