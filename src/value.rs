//! Producer-facing value tree.
//!
//! The routing layer hands the producer a mapping of top-level slots to
//! `StreamValue`s. A value may be plain JSON, an object or array whose
//! members are themselves `StreamValue`s, a deferred result, or an async
//! sequence -- nested arbitrarily deep.

use std::fmt;
use std::pin::Pin;

use futures::{Future, Stream};
use serde_json::Value;

/// A value that resolves exactly once, successfully or with failure.
pub type BoxDeferred = Pin<Box<dyn Future<Output = Result<StreamValue, anyhow::Error>> + Send>>;

/// A producer of zero or more values over time, ending in normal
/// completion or failure (the first `Err` item).
pub type BoxSequence = Pin<Box<dyn Stream<Item = Result<StreamValue, anyhow::Error>> + Send>>;

/// One node of the logical payload handed to the producer.
pub enum StreamValue {
    /// Plain JSON with no async values inside.
    Plain(Value),
    /// Object whose members may themselves be async.
    Object(Vec<(String, StreamValue)>),
    /// Array whose elements may themselves be async.
    Array(Vec<StreamValue>),
    /// Single eventual success-or-failure.
    Deferred(BoxDeferred),
    /// Zero or more items followed by completion or failure.
    Sequence(BoxSequence),
}

impl StreamValue {
    pub fn plain(value: impl Into<Value>) -> Self {
        Self::Plain(value.into())
    }

    pub fn object<K>(entries: impl IntoIterator<Item = (K, StreamValue)>) -> Self
    where
        K: Into<String>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn array(elements: impl IntoIterator<Item = StreamValue>) -> Self {
        Self::Array(elements.into_iter().collect())
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<StreamValue, anyhow::Error>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }

    pub fn sequence<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<StreamValue, anyhow::Error>> + Send + 'static,
    {
        Self::Sequence(Box::pin(stream))
    }

    /// True if any node of this subtree is deferred or a sequence.
    pub fn has_async(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Object(entries) => entries.iter().any(|(_, v)| v.has_async()),
            Self::Array(elements) => elements.iter().any(StreamValue::has_async),
            Self::Deferred(_) | Self::Sequence(_) => true,
        }
    }

    /// Collapse a purely-plain subtree to JSON. Callers check `has_async`
    /// first; async nodes encountered anyway degrade to null.
    pub(crate) fn into_plain(self) -> Value {
        match self {
            Self::Plain(v) => v,
            Self::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_plain()))
                    .collect(),
            ),
            Self::Array(elements) => {
                Value::Array(elements.into_iter().map(Self::into_plain).collect())
            }
            Self::Deferred(_) | Self::Sequence(_) => Value::Null,
        }
    }
}

impl From<Value> for StreamValue {
    fn from(value: Value) -> Self {
        Self::Plain(value)
    }
}

impl fmt::Debug for StreamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(v) => f.debug_tuple("Plain").field(v).finish(),
            Self::Object(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Self::Array(elements) => f.debug_list().entries(elements).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}
