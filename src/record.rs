//! Record and offset primitives.
//!
//! A `PartitionKey` identifies one independently-ordered slice of the input
//! stream; all buffering and offset state is tracked per key. The
//! `OffsetTracker` is the small piece of shared state between the record path
//! and the ingestion handoff worker.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identifies one partition of one input stream.
///
/// Immutable for the lifetime of the partition writer that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Directory name for this partition's temp subtree.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.topic, self.partition)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Value payload of an incoming record.
#[derive(Debug, Clone)]
pub enum RecordValue {
    /// A pre-rendered text line (CSV row, JSON document, ...).
    Text(String),
    /// Pre-encoded bytes (e.g. an Avro container) written through as-is.
    Bytes(Vec<u8>),
    /// A structured value rendered by the JSON encoder.
    Json(serde_json::Value),
}

impl RecordValue {
    /// Short name used in reject-sink reasons and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordValue::Text(_) => "text",
            RecordValue::Bytes(_) => "bytes",
            RecordValue::Json(_) => "json",
        }
    }
}

/// One record delivered by the upstream consumption layer.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub value: RecordValue,
}

impl SinkRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: RecordValue) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            value,
        }
    }

    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(self.topic.clone(), self.partition)
    }
}

const NO_COMMIT: i64 = -1;

/// Per-partition offset bookkeeping shared between the record path and the
/// ingestion handoff worker.
///
/// `current` is the highest offset observed; `last_committed` the highest
/// offset whose artifact was durably handed off. `last_committed` never runs
/// ahead of `current`, and only advances through `commit` when a handoff
/// outcome is known.
#[derive(Debug)]
pub struct OffsetTracker {
    current: AtomicI64,
    committed: AtomicI64,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            current: AtomicI64::new(0),
            committed: AtomicI64::new(NO_COMMIT),
        }
    }

    /// Record an observed offset. Redelivered (older) offsets are ignored so
    /// `current` stays monotonic under at-least-once redelivery.
    pub fn observe(&self, offset: i64) {
        self.current.fetch_max(offset, Ordering::AcqRel);
    }

    /// Advance the committed watermark after a successful (or reject-sink
    /// forwarded) handoff.
    pub fn commit(&self, offset: i64) {
        self.committed.fetch_max(offset, Ordering::AcqRel);
    }

    /// Highest offset observed. Starts at 0 before any record, matching the
    /// artifact-name preview for a fresh writer.
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    /// Highest offset known safe to commit upstream, if any handoff has
    /// completed yet.
    pub fn last_committed(&self) -> Option<i64> {
        match self.committed.load(Ordering::Acquire) {
            NO_COMMIT => None,
            offset => Some(offset),
        }
    }
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}
