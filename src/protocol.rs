//! Wire model for the multiplexed streaming value protocol.
//!
//! One physical line per logical record, newline-terminated:
//!
//! ```text
//! [
//! <serialized head>
//! ,<serialized chunk-update record>
//! ,<serialized chunk-update record>
//! ]
//! ```
//!
//! The leading `[` and trailing `]` are structural bookends, not data.
//! Every data line after the head starts with a single `,` separator that
//! is stripped before deserializing.
//!
//! The head is a JSON object mapping slot keys to hydrated values. A
//! hydrated value is `[[data], ...chunkDefs]` where async sub-values have
//! been replaced by the placeholder `0` and one chunk definition each. A
//! chunk update record is `[id, status]` or `[id, status, hydratedValue]`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::WireError;

/// Process-unique chunk identifier, allocated monotonically by the
/// producer session. The consumer never allocates ids, only matches them.
pub type ChunkId = u64;

/// Sentinel written into the data snapshot where an async value was
/// replaced by a chunk definition.
pub const PLACEHOLDER: u64 = 0;

/// Opening structural frame (its own line, never parsed as data).
pub const OPEN_FRAME: &str = "[";

/// Closing structural frame.
pub const CLOSE_FRAME: &str = "]";

/// Separator prefixed to every data line after the head.
pub const RECORD_SEPARATOR: char = ',';

// =============================================================================
// Status constants
// =============================================================================

/// Deferred terminal: resolved with a value.
pub const DEFERRED_STATUS_FULFILLED: u64 = 0;
/// Deferred terminal: failed. No error payload crosses the wire.
pub const DEFERRED_STATUS_REJECTED: u64 = 1;

/// Sequence terminal: completed normally.
pub const SEQUENCE_STATUS_DONE: u64 = 0;
/// Sequence: one item.
pub const SEQUENCE_STATUS_VALUE: u64 = 1;
/// Sequence terminal: failed.
pub const SEQUENCE_STATUS_ERROR: u64 = 2;

// =============================================================================
// Chunk kinds
// =============================================================================

/// Distinguishes the two async value shapes a chunk can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    /// Resolves exactly once, successfully or with failure.
    Deferred = 0,
    /// Zero or more items over time, ending in completion or failure.
    Sequence = 1,
}

impl ChunkKind {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Deferred),
            1 => Some(Self::Sequence),
            _ => None,
        }
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

// =============================================================================
// Chunk definitions
// =============================================================================

/// Locates where in a data node a chunk's eventual value must be spliced.
///
/// `key: None` means "replace the whole node"; `Some(key)` addresses a
/// direct child of an object-shaped node.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDef {
    pub key: Option<String>,
    pub kind: ChunkKind,
    pub id: ChunkId,
}

impl ChunkDef {
    pub fn encode(&self) -> Value {
        let key = match &self.key {
            Some(k) => Value::String(k.clone()),
            None => Value::Null,
        };
        Value::Array(vec![
            key,
            Value::from(self.kind.as_u64()),
            Value::from(self.id),
        ])
    }

    pub fn decode(value: &Value) -> Result<Self, WireError> {
        let parts = value
            .as_array()
            .ok_or(WireError::Shape("chunk definition is not an array"))?;
        if parts.len() != 3 {
            return Err(WireError::Shape("chunk definition must have 3 elements"));
        }
        let key = match &parts[0] {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            // Other producers may use numeric keys for array paths.
            Value::Number(n) => Some(n.to_string()),
            _ => return Err(WireError::Shape("chunk definition key must be null, string or number")),
        };
        let kind = parts[1]
            .as_u64()
            .and_then(ChunkKind::from_u64)
            .ok_or(WireError::Shape("unknown chunk kind"))?;
        let id = parts[2]
            .as_u64()
            .ok_or(WireError::Shape("chunk id must be an unsigned integer"))?;
        Ok(Self { key, kind, id })
    }
}

// =============================================================================
// Hydrated values
// =============================================================================

/// Wire representation of one value-tree node: the immediately-available
/// data (async sub-values replaced by the placeholder) plus one chunk
/// definition per async sub-value.
///
/// Encodes as `[[data], def, def, ...]`; `[[]]` when there is no data.
#[derive(Debug, Clone, PartialEq)]
pub struct HydratedValue {
    pub data: Option<Value>,
    pub defs: Vec<ChunkDef>,
}

impl HydratedValue {
    pub fn plain(data: Value) -> Self {
        Self {
            data: Some(data),
            defs: Vec::new(),
        }
    }

    pub fn encode(&self) -> Value {
        let data = match &self.data {
            Some(v) => vec![v.clone()],
            None => vec![],
        };
        let mut parts = vec![Value::Array(data)];
        parts.extend(self.defs.iter().map(ChunkDef::encode));
        Value::Array(parts)
    }

    pub fn decode(value: &Value) -> Result<Self, WireError> {
        let parts = value
            .as_array()
            .ok_or(WireError::Shape("hydrated value is not an array"))?;
        let data_cell = parts
            .first()
            .and_then(Value::as_array)
            .ok_or(WireError::Shape("hydrated value missing data cell"))?;
        if data_cell.len() > 1 {
            return Err(WireError::Shape("hydrated value data cell holds more than one value"));
        }
        let data = data_cell.first().cloned();
        let defs = parts[1..]
            .iter()
            .map(ChunkDef::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { data, defs })
    }
}

// =============================================================================
// Head
// =============================================================================

/// The serialized top-level mapping of slot -> hydrated value; the second
/// physical record on the wire. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Head {
    pub slots: BTreeMap<String, HydratedValue>,
}

impl Head {
    pub fn encode(&self) -> Value {
        let mut map = Map::new();
        for (slot, value) in &self.slots {
            map.insert(slot.clone(), value.encode());
        }
        Value::Object(map)
    }

    pub fn decode(value: &Value) -> Result<Self, WireError> {
        let map = value
            .as_object()
            .ok_or(WireError::Shape("head is not an object"))?;
        let mut slots = BTreeMap::new();
        for (slot, v) in map {
            slots.insert(slot.clone(), HydratedValue::decode(v)?);
        }
        Ok(Self { slots })
    }
}

// =============================================================================
// Chunk update records
// =============================================================================

/// Producer-side update record for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkUpdate {
    /// Deferred resolved: `[id, 0, value]`.
    Fulfilled { id: ChunkId, value: HydratedValue },
    /// Deferred failed: `[id, 1]`.
    Rejected { id: ChunkId },
    /// Sequence item: `[id, 1, value]`.
    Item { id: ChunkId, value: HydratedValue },
    /// Sequence completed: `[id, 0]`.
    Done { id: ChunkId },
    /// Sequence failed: `[id, 2]`.
    Error { id: ChunkId },
}

impl ChunkUpdate {
    pub fn id(&self) -> ChunkId {
        match self {
            Self::Fulfilled { id, .. }
            | Self::Rejected { id }
            | Self::Item { id, .. }
            | Self::Done { id }
            | Self::Error { id } => *id,
        }
    }

    pub fn encode(&self) -> Value {
        match self {
            Self::Fulfilled { id, value } => Value::Array(vec![
                Value::from(*id),
                Value::from(DEFERRED_STATUS_FULFILLED),
                value.encode(),
            ]),
            Self::Rejected { id } => Value::Array(vec![
                Value::from(*id),
                Value::from(DEFERRED_STATUS_REJECTED),
            ]),
            Self::Item { id, value } => Value::Array(vec![
                Value::from(*id),
                Value::from(SEQUENCE_STATUS_VALUE),
                value.encode(),
            ]),
            Self::Done { id } => Value::Array(vec![
                Value::from(*id),
                Value::from(SEQUENCE_STATUS_DONE),
            ]),
            Self::Error { id } => Value::Array(vec![
                Value::from(*id),
                Value::from(SEQUENCE_STATUS_ERROR),
            ]),
        }
    }
}

/// Consumer-side update record, kept raw on purpose: the deferred and
/// sequence status spaces overlap numerically (`[id, 0]` is a fulfilled
/// deferred's prefix and a completed sequence), so a record can only be
/// interpreted by the handle that knows its chunk's kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUpdate {
    pub id: ChunkId,
    pub status: u64,
    pub value: Option<HydratedValue>,
}

impl RawUpdate {
    pub fn decode(value: &Value) -> Result<Self, WireError> {
        let parts = value
            .as_array()
            .ok_or(WireError::Shape("chunk update is not an array"))?;
        if parts.len() < 2 || parts.len() > 3 {
            return Err(WireError::Shape("chunk update must have 2 or 3 elements"));
        }
        let id = parts[0]
            .as_u64()
            .ok_or(WireError::Shape("chunk update id must be an unsigned integer"))?;
        let status = parts[1]
            .as_u64()
            .ok_or(WireError::Shape("chunk update status must be an unsigned integer"))?;
        let value = match parts.get(2) {
            Some(v) => Some(HydratedValue::decode(v)?),
            None => None,
        };
        Ok(Self { id, status, value })
    }
}
