//! Multiplexed streaming values over a single ordered byte stream.
//!
//! One logical response -- a mapping of top-level slots to values -- is
//! transmitted as newline-delimited JSON, where any value (at any nesting
//! depth) may be a deferred result or an unbounded async sequence that
//! resolves independently of the head and of every other value.
//!
//! # Architecture
//!
//! ```text
//! Producer:
//! +-----------+     +----------------+     +-----------------+
//! |  handler  | --> | hydrate walker | --> | stream assembler| --> bytes
//! | (values)  |     | (chunk tasks)  |     | (head + records)|
//! +-----------+     +----------------+     +-----------------+
//!
//! Consumer:
//! bytes --> +-------------+     +----------------+     +------------------+
//!           | accumulator | --> | stream reader  | --> | chunk registry   |
//!           | (lines)     |     | (head + demux) |     | (queue per chunk)|
//!           +-------------+     +----------------+     +------------------+
//!                                      |
//!                                      v
//!                               dehydrate walker (live handles)
//! ```
//!
//! The consumer starts using the synchronously-available parts of the
//! response immediately; async parts materialize lazily as their chunk
//! update records arrive. Ordering is guaranteed within one chunk, never
//! between chunks. An SSE variant ([`sse`]) reframes the same model for a
//! single top-level sequence with reconnect-and-resume semantics.

pub mod accumulate;
pub mod consume;
pub mod dehydrate;
pub mod error;
pub mod hydrate;
pub mod produce;
pub mod protocol;
pub mod registry;
pub mod sse;
pub mod value;

pub use accumulate::LineAccumulator;
pub use consume::{consume, ConsumerConfig, ConsumerOnError, DeserializeFn, HeadMap, StreamMeta};
pub use dehydrate::{DehydratedValue, DeferredHandle, SequenceHandle};
pub use error::{ChunkError, ConsumeError, MaxDepthError, WireError};
pub use hydrate::OnError;
pub use produce::{produce, ProducerConfig, ProducerStream, SerializeFn};
pub use protocol::{ChunkDef, ChunkId, ChunkKind, ChunkUpdate, Head, HydratedValue, RawUpdate};
pub use registry::{ChunkEvent, ChunkRegistry};
pub use sse::{
    sse_produce, sse_resume, SseConsumer, SseConsumerConfig, SseEvent, SseProducerConfig,
    SseProducerStream,
};
pub use value::{BoxDeferred, BoxSequence, StreamValue};
