//! Producer stream assembler.
//!
//! Serializes the head plus the live feed of chunk update records into the
//! newline-delimited wire format: opening frame, head frame, one framed
//! line per update, and the closing frame once every chunk task has
//! finished. Output starts flowing before any chunk resolves -- that is
//! the entire reason this design exists.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::hydrate::{OnError, Session};
use crate::protocol::{ChunkUpdate, Head, CLOSE_FRAME, OPEN_FRAME, RECORD_SEPARATOR};
use crate::value::StreamValue;

/// Pluggable value transform applied to the head as a whole and to every
/// update record, never to raw framing tokens.
pub type SerializeFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Producer options. `max_depth` bounds the nesting depth of async values;
/// a violation fails only the offending sub-path, never the response.
#[derive(Default, Clone)]
pub struct ProducerConfig {
    pub serialize: Option<SerializeFn>,
    pub on_error: Option<OnError>,
    pub max_depth: Option<usize>,
}

/// Hydrate `data` and assemble the wire stream.
///
/// Returns the head (placeholders already substituted) alongside the byte
/// stream carrying it. Must be called from within a tokio runtime: one
/// task is spawned per registered chunk.
pub fn produce(data: Vec<(String, StreamValue)>, config: ProducerConfig) -> (Head, ProducerStream) {
    let (session, updates) = Session::new(config.max_depth, config.on_error);
    let head = session.hydrate_root(data);
    // Drop the session's own sender so the update channel closes once the
    // last chunk task finishes.
    drop(session);

    let mut head_value = head.encode();
    if let Some(serialize) = &config.serialize {
        head_value = serialize(head_value);
    }

    let stream = ProducerStream {
        state: State::Opening,
        head: Some(head_value),
        updates,
        serialize: config.serialize,
    };
    (head, stream)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Opening,
    Head,
    Updates,
    Done,
}

/// The assembled wire byte stream. Dropping it cancels the producer side:
/// chunk tasks observe the closed channel and stop.
pub struct ProducerStream {
    state: State,
    head: Option<Value>,
    updates: mpsc::Receiver<ChunkUpdate>,
    serialize: Option<SerializeFn>,
}

impl ProducerStream {
    fn frame_update(&self, update: ChunkUpdate) -> Bytes {
        let mut value = update.encode();
        if let Some(serialize) = &self.serialize {
            value = serialize(value);
        }
        Bytes::from(format!("{RECORD_SEPARATOR}{value}\n"))
    }

    /// Drain the stream into `writer`, flushing after every frame so the
    /// consumer can start on the head while chunks are still pending.
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

impl Stream for ProducerStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        match this.state {
            State::Opening => {
                this.state = State::Head;
                Poll::Ready(Some(Bytes::from(format!("{OPEN_FRAME}\n"))))
            }
            State::Head => {
                this.state = State::Updates;
                let head = this.head.take().unwrap_or(Value::Null);
                Poll::Ready(Some(Bytes::from(format!("{head}\n"))))
            }
            State::Updates => match this.updates.poll_recv(cx) {
                Poll::Ready(Some(update)) => Poll::Ready(Some(this.frame_update(update))),
                Poll::Ready(None) => {
                    this.state = State::Done;
                    Poll::Ready(Some(Bytes::from(format!("{CLOSE_FRAME}\n"))))
                }
                Poll::Pending => Poll::Pending,
            },
            State::Done => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn collect_lines(stream: ProducerStream) -> Vec<String> {
        let bytes: Vec<Bytes> = stream.collect().await;
        let mut joined = Vec::new();
        for frame in bytes {
            joined.extend_from_slice(&frame);
        }
        String::from_utf8(joined)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_plain_stream_is_bookended() {
        let (_, stream) = produce(
            vec![("greeting".to_string(), StreamValue::plain("hi"))],
            ProducerConfig::default(),
        );
        let lines = collect_lines(stream).await;
        assert_eq!(lines, vec!["[", r#"{"greeting":[["hi"]]}"#, "]"]);
    }

    #[tokio::test]
    async fn test_update_lines_carry_separator() {
        let (_, stream) = produce(
            vec![(
                "v".to_string(),
                StreamValue::deferred(async { Ok(StreamValue::plain(7)) }),
            )],
            ProducerConfig::default(),
        );
        let lines = collect_lines(stream).await;
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "[");
        assert_eq!(lines[1], r#"{"v":[[0],[null,0,0]]}"#);
        assert_eq!(lines[2], ",[0,0,[[7]]]");
        assert_eq!(lines[3], "]");
    }

    #[tokio::test]
    async fn test_serialize_hook_wraps_head_and_records() {
        let serialize: SerializeFn = Arc::new(|v| json!({"wrapped": v}));
        let (_, stream) = produce(
            vec![(
                "v".to_string(),
                StreamValue::deferred(async { Ok(StreamValue::plain(1)) }),
            )],
            ProducerConfig {
                serialize: Some(serialize),
                ..Default::default()
            },
        );
        let lines = collect_lines(stream).await;
        assert!(lines[1].starts_with(r#"{"wrapped":"#));
        assert!(lines[2].starts_with(r#",{"wrapped":"#));
        assert_eq!(lines[0], "[");
        assert_eq!(lines[3], "]");
    }
}
