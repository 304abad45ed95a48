//! Consumer stream reader.
//!
//! State machine: AwaitingHead -> Streaming -> Closed. Bytes are fed into
//! the line accumulator until the opening marker and the head line are
//! available; the head is dehydrated immediately so the caller receives
//! live handles without waiting for the tail of the stream. A background
//! task then demultiplexes the remaining records into the chunk registry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::accumulate::LineAccumulator;
use crate::dehydrate::{dehydrate, DehydratedValue};
use crate::error::{ConsumeError, WireError};
use crate::protocol::{Head, RawUpdate, CLOSE_FRAME, OPEN_FRAME, RECORD_SEPARATOR};
use crate::registry::ChunkRegistry;

/// Pluggable inverse of the producer's serialize hook, applied to the head
/// value and to every update record after JSON parsing.
pub type DeserializeFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Fired at most once when the background reader stops abnormally
/// (transport error, abort, malformed record).
pub type ConsumerOnError = Arc<dyn Fn(&ConsumeError) + Send + Sync>;

#[derive(Default, Clone)]
pub struct ConsumerConfig {
    pub deserialize: Option<DeserializeFn>,
    pub on_error: Option<ConsumerOnError>,
}

/// The caller-visible head: top-level slots with live handles substituted
/// for the wire placeholders.
pub type HeadMap = BTreeMap<String, DehydratedValue>;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Read the head off `from`, then keep demultiplexing chunk updates in the
/// background until the closing frame, end of stream, or an abort.
///
/// Fails with a wire error if the first two logical lines never arrive --
/// no partial head is usable.
pub async fn consume<R>(
    mut from: R,
    config: ConsumerConfig,
) -> Result<(HeadMap, StreamMeta), ConsumeError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut accumulator = LineAccumulator::new();
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    // AWAITING_HEAD
    while pending.len() < 2 {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Err(WireError::MissingHead.into());
        }
        pending.extend(accumulator.push(&buf[..n])?);
    }

    let opening = pending.pop_front().ok_or(WireError::MissingHead)?;
    if opening != OPEN_FRAME {
        return Err(WireError::BadOpening(opening).into());
    }
    let head_line = pending.pop_front().ok_or(WireError::MissingHead)?;
    let mut head_value: Value = serde_json::from_str(&head_line).map_err(WireError::Json)?;
    if let Some(deserialize) = &config.deserialize {
        head_value = deserialize(head_value);
    }
    let head = Head::decode(&head_value)?;

    // STREAMING: dehydrate synchronously, demultiplex in the background.
    let registry = ChunkRegistry::new();
    let mut slots = BTreeMap::new();
    for (slot, value) in head.slots {
        slots.insert(slot, dehydrate(value, &registry));
    }

    let shutdown = Arc::new(Notify::new());
    let reader = tokio::spawn(read_loop(
        from,
        accumulator,
        pending,
        registry.clone(),
        config,
        Arc::clone(&shutdown),
    ));

    let meta = StreamMeta {
        registry,
        shutdown,
        reader,
    };
    Ok((slots, meta))
}

/// Handle on the live stream: the chunk registry (diagnostics/tests), the
/// outer abort signal, and the background reader task.
#[derive(Debug)]
pub struct StreamMeta {
    registry: ChunkRegistry,
    shutdown: Arc<Notify>,
    reader: JoinHandle<()>,
}

impl StreamMeta {
    pub fn registry(&self) -> &ChunkRegistry {
        &self.registry
    }

    /// Abort the whole stream: the transport read stops and every
    /// still-open chunk observes the interrupted event. Cancellation of a
    /// single chunk, by contrast, is just dropping its handle.
    pub fn abort(&self) {
        self.shutdown.notify_one();
    }

    /// Wait for the background reader to stop.
    pub async fn wait(&mut self) {
        let _ = (&mut self.reader).await;
    }
}

async fn read_loop<R>(
    mut from: R,
    mut accumulator: LineAccumulator,
    mut pending: VecDeque<String>,
    registry: ChunkRegistry,
    config: ConsumerConfig,
    shutdown: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
{
    let result: Result<(), ConsumeError> = async {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            while let Some(line) = pending.pop_front() {
                if process_line(&line, &registry, &config)? == LineOutcome::Closed {
                    return Ok(());
                }
            }
            let n = tokio::select! {
                _ = shutdown.notified() => return Err(ConsumeError::Aborted),
                read = from.read(&mut buf) => read?,
            };
            if n == 0 {
                // End of transport without the closing bookend: clean when
                // no chunk is open, a truncation otherwise.
                if registry.is_empty() {
                    return Ok(());
                }
                return Err(ConsumeError::Truncated);
            }
            pending.extend(accumulator.push(&buf[..n])?);
        }
    }
    .await;

    if let Err(error) = result {
        tracing::debug!(%error, "stream reader stopped");
        if let Some(on_error) = &config.on_error {
            on_error(&error);
        }
    }
    registry.interrupt_all();
}

#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Record,
    Closed,
}

fn process_line(
    line: &str,
    registry: &ChunkRegistry,
    config: &ConsumerConfig,
) -> Result<LineOutcome, ConsumeError> {
    if line == CLOSE_FRAME {
        return Ok(LineOutcome::Closed);
    }
    if line.is_empty() {
        return Ok(LineOutcome::Record);
    }
    let record = line
        .strip_prefix(RECORD_SEPARATOR)
        .ok_or_else(|| WireError::MissingSeparator(line.to_string()))?;
    let mut value: Value = serde_json::from_str(record).map_err(WireError::Json)?;
    if let Some(deserialize) = &config.deserialize {
        value = deserialize(value);
    }
    let update = RawUpdate::decode(&value)?;
    tracing::trace!(id = update.id, status = update.status, "chunk update");
    registry.deliver(update);
    Ok(LineOutcome::Record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_missing_head_fails_instead_of_hanging() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"[\n").await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);

        let err = consume(rx, ConsumerConfig::default()).await.unwrap_err();
        assert!(matches!(err, ConsumeError::Wire(WireError::MissingHead)));
    }

    #[tokio::test]
    async fn test_bad_opening_frame_is_rejected() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"{}\n{}\n").await.unwrap();

        let err = consume(rx, ConsumerConfig::default()).await.unwrap_err();
        assert!(matches!(err, ConsumeError::Wire(WireError::BadOpening(_))));
    }

    #[tokio::test]
    async fn test_unparsable_head_is_rejected() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"[\nnot json\n").await.unwrap();

        let err = consume(rx, ConsumerConfig::default()).await.unwrap_err();
        assert!(matches!(err, ConsumeError::Wire(WireError::Json(_))));
    }

    #[tokio::test]
    async fn test_eof_with_nothing_open_is_clean() {
        let reported = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        let config = ConsumerConfig {
            on_error: Some(Arc::new(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })),
            ..Default::default()
        };

        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"[\n{}\n").await.unwrap();

        let (head, mut meta) = consume(rx, config).await.unwrap();
        assert!(head.is_empty());
        drop(tx);
        meta.wait().await;
        assert_eq!(reported.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_record_without_separator_interrupts() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tx.write_all(b"[\n{\"v\":[[0],[null,0,0]]}\n").await.unwrap();

        let (mut head, mut meta) = consume(rx, ConsumerConfig::default()).await.unwrap();
        let handle = head.remove("v").unwrap().into_deferred().unwrap();

        tx.write_all(b"[0,0,[[1]]]\n").await.unwrap(); // separator missing
        let err = handle.resolve().await.unwrap_err();
        assert_eq!(err, crate::error::ChunkError::Interrupted);
        meta.wait().await;
        assert!(meta.registry().is_empty());
    }
}
