//! Per-partition orchestrator.
//!
//! Owns one rolling buffer, serializes incoming records, keeps the offset
//! bookkeeping and decides when to roll. The writer is driven from two sides
//! (the record path and the flush scheduler tick) but both serialize through
//! the mutex the sink wraps around each writer, so a roll and an append can
//! never interleave.
//!
//! # Artifact naming
//!
//! The first artifact is named lazily when its first record arrives, with
//! that record's offset as the marker. An artifact opened by a roll carries
//! the triggering record's offset, advanced past the sealed artifact's marker
//! when the two would collide. Names never change after open; re-feeding
//! the same records after a crash regenerates the same artifact identities,
//! which is what makes at-least-once redelivery idempotent downstream.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::RollingBuffer;
use crate::config::IngestionTarget;
use crate::encode::Encoder;
use crate::error::{Error, Result};
use crate::ingest::{IngestionHandoff, IngestionTask, PartitionFault, RejectSink};
use crate::policy::ThresholdPolicy;
use crate::record::{OffsetTracker, PartitionKey, RecordValue, SinkRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Closed,
    Open,
}

pub struct PartitionWriter {
    key: PartitionKey,
    target: IngestionTarget,
    encoder: Encoder,
    policy: ThresholdPolicy,
    buffer: RollingBuffer,
    tracker: Arc<OffsetTracker>,
    handoff: Arc<IngestionHandoff>,
    reject: Option<Arc<dyn RejectSink>>,
    fault: Arc<PartitionFault>,
    state: WriterState,
    /// Offset of the first record appended to the open artifact. The buffer's
    /// name marker can differ after a time-triggered roll, so the task's
    /// offset range is tracked here.
    first_offset: Option<i64>,
    close_timeout: Duration,
}

impl PartitionWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: PartitionKey,
        target: IngestionTarget,
        policy: ThresholdPolicy,
        temp_root: &Path,
        handoff: Arc<IngestionHandoff>,
        reject: Option<Arc<dyn RejectSink>>,
        close_timeout: Duration,
    ) -> Result<Self> {
        let buffer = RollingBuffer::new(temp_root, key.clone(), target.format)?;
        Ok(Self {
            encoder: Encoder::new(target.format),
            key,
            target,
            policy,
            buffer,
            tracker: Arc::new(OffsetTracker::new()),
            handoff,
            reject,
            fault: Arc::new(PartitionFault::new()),
            state: WriterState::Closed,
            first_offset: None,
            close_timeout,
        })
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    /// Highest offset observed on this partition.
    pub fn current_offset(&self) -> i64 {
        self.tracker.current()
    }

    /// Highest offset durably handed off; safe for the upstream layer to
    /// commit.
    pub fn last_committed_offset(&self) -> Option<i64> {
        self.tracker.last_committed()
    }

    /// Preview of the path the next artifact would get if opened right now.
    ///
    /// Uses `offset_override` if given, otherwise `current + 1` once the open
    /// artifact has records, otherwise `current` (0 for a fresh writer). The
    /// open artifact's own name was fixed at open time and is not affected.
    pub fn file_path(&self, offset_override: Option<i64>) -> PathBuf {
        let marker = offset_override.unwrap_or_else(|| {
            if self.buffer.raw_bytes() > 0 {
                self.tracker.current() + 1
            } else {
                self.tracker.current()
            }
        });
        self.buffer.artifact_path(marker)
    }

    /// Fixed path of the currently open artifact, if one exists.
    pub fn current_artifact_path(&self) -> Option<&Path> {
        self.buffer.current_path()
    }

    /// Transition Closed -> Open. The first artifact is created lazily when
    /// the first record arrives.
    pub fn open(&mut self) -> Result<()> {
        if self.state == WriterState::Open {
            return Err(Error::AlreadyOpen);
        }
        self.state = WriterState::Open;
        log::info!(
            "{}: writer open ({}.{}, {} format)",
            self.key,
            self.target.database,
            self.target.table,
            self.target.format
        );
        Ok(())
    }

    /// Serialize and buffer one record, rolling if a threshold is crossed.
    ///
    /// # Errors
    ///
    /// - `Error::Serialization` when the record cannot be encoded and no
    ///   reject sink is configured (with one, the record is forwarded and
    ///   the partition continues).
    /// - `Error::Write` on storage failure; fatal to the partition.
    /// - `Error::PartitionFailed` once a background handoff fatality has
    ///   been recorded.
    pub fn write_record(&mut self, record: &SinkRecord) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(Error::NotOpen);
        }
        self.check_fault()?;
        debug_assert_eq!(record.topic, self.key.topic);
        debug_assert_eq!(record.partition, self.key.partition);

        self.tracker.observe(record.offset);

        let bytes = match self.encoder.encode(&record.value) {
            Ok(bytes) => bytes,
            Err(Error::Serialization(reason)) => {
                return self.reject_record(record, &reason);
            }
            Err(other) => return Err(other),
        };

        let now = Instant::now();
        if !self.buffer.is_open() {
            // Lazy open: the marker is this record's offset.
            self.buffer.open(self.tracker.current(), now)?;
        }
        if self.first_offset.is_none() {
            self.first_offset = Some(record.offset);
        }

        let raw_bytes = self.buffer.append(&bytes)?;
        let opened_at = self.buffer.opened_at().unwrap_or(now);
        if self.policy.should_roll(raw_bytes, opened_at, now) {
            self.roll(now)?;
        }
        Ok(())
    }

    /// Shared roll-evaluation entry point used by the flush scheduler.
    ///
    /// Rolls a non-empty artifact whose time threshold has elapsed; an empty
    /// artifact is never sealed.
    pub fn evaluate_roll(&mut self, now: Instant) -> Result<()> {
        if self.state != WriterState::Open || !self.buffer.is_open() {
            return Ok(());
        }
        let opened_at = match self.buffer.opened_at() {
            Some(opened_at) => opened_at,
            None => return Ok(()),
        };
        if self.policy.should_roll(self.buffer.raw_bytes(), opened_at, now) {
            self.roll(now)?;
        }
        Ok(())
    }

    /// Seal the current artifact, submit it, and open the next one.
    fn roll(&mut self, now: Instant) -> Result<()> {
        let sealed_marker = self.submit_sealed()?;
        // The next artifact carries the triggering record's offset as its
        // marker, advanced past the sealed marker so a single-record roll
        // never reopens under the name of a file still awaiting handoff.
        let marker = self.tracker.current().max(sealed_marker + 1);
        self.buffer.open(marker, now)?;
        Ok(())
    }

    fn submit_sealed(&mut self) -> Result<i64> {
        let sealed = self.buffer.seal()?;
        let sealed_marker = sealed.marker;
        let first_offset = self.first_offset.take().unwrap_or(sealed.marker);
        let last_offset = self.tracker.current();
        log::info!(
            "{}: rolling {} ({} raw bytes, offsets {}..={})",
            self.key,
            sealed.path.display(),
            sealed.raw_bytes,
            first_offset,
            last_offset
        );
        self.handoff.submit(IngestionTask {
            artifact: sealed,
            key: self.key.clone(),
            database: self.target.database.clone(),
            table: self.target.table.clone(),
            first_offset,
            last_offset,
            tracker: Arc::clone(&self.tracker),
            fault: Arc::clone(&self.fault),
        })?;
        Ok(sealed_marker)
    }

    /// Graceful shutdown: flush a non-empty buffer, wait for this
    /// partition's in-flight handoffs, transition to Closed.
    ///
    /// A non-empty buffer is never dropped silently. After this returns, no
    /// background work touches the partition's resources.
    pub fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        if self.buffer.is_open() {
            if self.buffer.raw_bytes() > 0 {
                self.submit_sealed()?;
            } else {
                self.buffer.discard();
            }
        }
        self.state = WriterState::Closed;
        self.first_offset = None;

        if !self.handoff.wait_idle(&self.key, self.close_timeout) {
            log::warn!(
                "{}: close timed out after {:?} with handoffs in flight",
                self.key,
                self.close_timeout
            );
        }
        self.check_fault()?;
        log::info!("{}: writer closed", self.key);
        Ok(())
    }

    fn check_fault(&self) -> Result<()> {
        match self.fault.reason() {
            Some(reason) => Err(Error::PartitionFailed(format!("{}: {reason}", self.key))),
            None => Ok(()),
        }
    }

    /// Forward an unencodable record to the reject sink, or fail the
    /// partition when none is configured.
    fn reject_record(&mut self, record: &SinkRecord, reason: &str) -> Result<()> {
        let Some(sink) = self.reject.as_deref() else {
            return Err(Error::Serialization(format!(
                "{}: offset {}: {reason} (no reject sink configured)",
                self.key, record.offset
            )));
        };
        log::warn!(
            "{}: forwarding offset {} to reject sink: {reason}",
            self.key,
            record.offset
        );
        let payload = record_payload(&record.value);
        if let Err(err) = sink.forward(
            &self.key.topic,
            self.key.partition,
            record.offset,
            record.offset,
            reason,
            payload.as_deref(),
        ) {
            log::warn!("{}: reject sink forward failed: {err}", self.key);
        }
        Ok(())
    }
}

fn record_payload(value: &RecordValue) -> Option<Vec<u8>> {
    match value {
        RecordValue::Text(text) => Some(text.as_bytes().to_vec()),
        RecordValue::Bytes(bytes) => Some(bytes.clone()),
        RecordValue::Json(json) => serde_json::to_vec(json).ok(),
    }
}
