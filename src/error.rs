//! Error taxonomy for the streaming value protocol.
//!
//! Three distinct failure domains:
//! - `WireError`: malformed wire data (missing head, bad JSON, wrong shape).
//!   Fails the whole consume call outright.
//! - `ChunkError`: terminal failure of a single chunk, local to whoever is
//!   awaiting that chunk. Siblings are unaffected.
//! - `ConsumeError`: failure of the consume call or its background reader.

use thiserror::Error;

/// Malformed wire data. No partial head is usable, so any of these fails
/// the whole consume call (or stops the background reader, delivering
/// interruption to every open chunk).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("stream ended before the head was received")]
    MissingHead,

    #[error("invalid opening frame: expected '[', got {0:?}")]
    BadOpening(String),

    #[error("record is missing the ',' separator: {0:?}")]
    MissingSeparator(String),

    #[error("invalid UTF-8 in stream")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected record shape: {0}")]
    Shape(&'static str),
}

/// Terminal failure observed on a single chunk.
///
/// `Remote` and `Interrupted` are deliberately the only two cases: the
/// concrete server-side error never crosses the wire, only the qualitative
/// fact of failure does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// The producer reported a failure for this value.
    #[error("received error from server")]
    Remote,

    /// The transport ended or was aborted before this chunk reached a
    /// terminal state.
    #[error("invalid response or stream interrupted")]
    Interrupted,
}

/// Failure of the whole consume call or its background reader.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("transport read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended before all chunks completed")]
    Truncated,

    #[error("stream aborted")]
    Aborted,
}

/// Producer-side depth violation, scoped to one sub-path.
///
/// Delivered to the consumer as a normal terminal failure on the offending
/// chunk and reported through the producer's `on_error` side channel; never
/// fatal to sibling chunks.
#[derive(Debug, Error)]
#[error("max depth reached at path: {}", path.join("."))]
pub struct MaxDepthError {
    pub path: Vec<String>,
}
