//! Ingestion handoff.
//!
//! Sealed artifacts are submitted to the remote bulk-ingest client on a
//! dedicated worker thread so a slow or retrying remote call never blocks the
//! record path. Each task terminates in exactly one of three states:
//! committed (artifact deleted), forwarded to the reject sink (artifact
//! deleted, batch counted as committed for local cleanup), or partition-fatal
//! (surfaced to the writer on its next call).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::buffer::SealedArtifact;
use crate::encode::Format;
use crate::error::{Error, Result};
use crate::record::{OffsetTracker, PartitionKey};

/// Submission request handed to the bulk-ingest client.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub path: PathBuf,
    /// Uncompressed size of the batch.
    pub size_bytes: u64,
    pub database: String,
    pub table: String,
    pub format: Format,
}

/// Failure reported by an ingest client or reject sink.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct IngestError(pub String);

/// Boundary to the remote bulk-ingestion service.
///
/// Implementations are shared across all partition writers and must tolerate
/// concurrent submissions.
pub trait IngestClient: Send + Sync {
    fn submit_artifact(&self, request: &ArtifactRequest) -> std::result::Result<(), IngestError>;
}

/// Secondary destination for records and batches that cannot be processed.
///
/// Forwarding is best effort: failures are logged by the caller and never
/// escalate.
pub trait RejectSink: Send + Sync {
    fn forward(
        &self,
        topic: &str,
        partition: i32,
        first_offset: i64,
        last_offset: i64,
        reason: &str,
        payload: Option<&[u8]>,
    ) -> std::result::Result<(), IngestError>;
}

/// Bounded-retry settings for handoff submissions.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
        }
    }

    pub fn state(&self) -> RetryState {
        RetryState {
            max_attempts: self.max_attempts,
            attempt: 0,
            next_backoff: self.initial_backoff,
        }
    }
}

/// Explicit retry state machine: attempt count and next backoff, terminating
/// in success, reject-sink forwarding or partition failure.
#[derive(Debug)]
pub struct RetryState {
    max_attempts: u32,
    attempt: u32,
    next_backoff: Duration,
}

impl RetryState {
    /// Register a failed attempt. Returns the backoff to sleep before the
    /// next attempt, or `None` once attempts are exhausted.
    pub fn backoff_after_failure(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let backoff = self.next_backoff;
        self.next_backoff = self.next_backoff.saturating_mul(2);
        Some(backoff)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Shared fatal-fault slot for one partition.
///
/// The handoff worker records an unrecoverable ingestion failure here; the
/// partition writer checks it on every call and stops accepting records.
#[derive(Debug, Default)]
pub struct PartitionFault {
    reason: Mutex<Option<String>>,
}

impl PartitionFault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, reason: String) {
        let mut slot = self.reason.lock().expect("fault lock poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("fault lock poisoned").clone()
    }
}

/// One sealed artifact queued for submission.
pub struct IngestionTask {
    pub artifact: SealedArtifact,
    pub key: PartitionKey,
    pub database: String,
    pub table: String,
    pub first_offset: i64,
    pub last_offset: i64,
    pub tracker: Arc<OffsetTracker>,
    pub fault: Arc<PartitionFault>,
}

enum HandoffMessage {
    Task(Box<IngestionTask>),
    Shutdown,
}

/// Per-partition in-flight counters, used for the bounded waits at
/// writer-close and sink-shutdown time.
#[derive(Default)]
struct PendingTasks {
    counts: Mutex<HashMap<PartitionKey, usize>>,
    idle: Condvar,
}

impl PendingTasks {
    fn add(&self, key: &PartitionKey) {
        let mut counts = self.counts.lock().expect("pending lock poisoned");
        *counts.entry(key.clone()).or_insert(0) += 1;
    }

    fn done(&self, key: &PartitionKey) {
        let mut counts = self.counts.lock().expect("pending lock poisoned");
        if let Some(count) = counts.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(key);
            }
        }
        self.idle.notify_all();
    }

    fn wait_idle(&self, key: &PartitionKey, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock().expect("pending lock poisoned");
        while counts.contains_key(key) {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return false,
            };
            let (guard, _) = self
                .idle
                .wait_timeout(counts, remaining)
                .expect("pending lock poisoned");
            counts = guard;
        }
        true
    }

    fn wait_all_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock().expect("pending lock poisoned");
        while !counts.is_empty() {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return false,
            };
            let (guard, _) = self
                .idle
                .wait_timeout(counts, remaining)
                .expect("pending lock poisoned");
            counts = guard;
        }
        true
    }
}

/// Submits sealed artifacts to the ingest client off the record path.
pub struct IngestionHandoff {
    tx: Sender<HandoffMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<PendingTasks>,
}

impl IngestionHandoff {
    pub fn new(
        client: Arc<dyn IngestClient>,
        reject: Option<Arc<dyn RejectSink>>,
        retry: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<HandoffMessage>();
        let pending = Arc::new(PendingTasks::default());
        let worker_pending = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("sluice-handoff".into())
            .spawn(move || {
                for msg in rx {
                    match msg {
                        HandoffMessage::Task(task) => {
                            let key = task.key.clone();
                            process_task(client.as_ref(), reject.as_deref(), retry, *task);
                            worker_pending.done(&key);
                        }
                        HandoffMessage::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn handoff worker");

        Self {
            tx,
            worker: Mutex::new(Some(handle)),
            pending,
        }
    }

    /// Queue a task for submission. Non-blocking with respect to the writer.
    pub fn submit(&self, task: IngestionTask) -> Result<()> {
        self.pending.add(&task.key);
        let key = task.key.clone();
        self.tx
            .send(HandoffMessage::Task(Box::new(task)))
            .map_err(|_| {
                self.pending.done(&key);
                Error::Ingestion("handoff worker has stopped".into())
            })
    }

    /// Wait until no submissions are in flight for `key`, up to `timeout`.
    /// Returns false if the timeout expired first.
    pub fn wait_idle(&self, key: &PartitionKey, timeout: Duration) -> bool {
        self.pending.wait_idle(key, timeout)
    }

    /// Drain queued tasks and stop the worker.
    ///
    /// Waits up to `timeout` for in-flight submissions; if they do not
    /// settle, the worker is detached and left to finish on its own.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.pending.wait_all_idle(timeout);
        let _ = self.tx.send(HandoffMessage::Shutdown);
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            if drained {
                let _ = handle.join();
            } else {
                log::warn!("handoff shutdown timed out with submissions in flight");
            }
        }
        drained
    }
}

fn process_task(
    client: &dyn IngestClient,
    reject: Option<&dyn RejectSink>,
    retry: RetryPolicy,
    task: IngestionTask,
) {
    let request = ArtifactRequest {
        path: task.artifact.path.clone(),
        size_bytes: task.artifact.raw_bytes,
        database: task.database.clone(),
        table: task.table.clone(),
        format: task.artifact.format,
    };

    let mut state = retry.state();
    let exhausted = loop {
        match client.submit_artifact(&request) {
            Ok(()) => {
                task.tracker.commit(task.last_offset);
                log::info!(
                    "{}: ingested {} ({} raw bytes, offsets {}..={})",
                    task.key,
                    request.path.display(),
                    request.size_bytes,
                    task.first_offset,
                    task.last_offset
                );
                remove_artifact(&request.path);
                return;
            }
            Err(err) => match state.backoff_after_failure() {
                Some(backoff) => {
                    log::warn!(
                        "{}: ingestion attempt {} failed ({err}), retrying in {:?}",
                        task.key,
                        state.attempts(),
                        backoff
                    );
                    thread::sleep(backoff);
                }
                None => break err,
            },
        }
    };

    match reject {
        Some(sink) => {
            log::warn!(
                "{}: ingestion exhausted after {} attempts ({exhausted}), forwarding batch to reject sink",
                task.key,
                state.attempts()
            );
            let reason = format!(
                "ingestion failed after {} attempts: {exhausted}",
                state.attempts()
            );
            if let Err(err) = sink.forward(
                &task.key.topic,
                task.key.partition,
                task.first_offset,
                task.last_offset,
                &reason,
                None,
            ) {
                log::warn!("{}: reject sink forward failed: {err}", task.key);
            }
            // Forwarded batches count as committed so local storage stays
            // bounded.
            task.tracker.commit(task.last_offset);
            remove_artifact(&request.path);
        }
        None => {
            let reason = format!(
                "ingestion of {} failed after {} attempts: {exhausted}",
                request.path.display(),
                state.attempts()
            );
            log::error!("{}: {reason}", task.key);
            task.fault.fail(reason);
        }
    }
}

fn remove_artifact(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        log::warn!("failed to remove artifact {}: {err}", path.display());
    }
}

/// Filesystem ingest client: moves sealed artifacts into a spool directory.
///
/// Stands in for the remote service in the CLI and in tests; the real remote
/// client lives behind the same trait outside this crate.
pub struct SpoolIngestClient {
    spool_dir: PathBuf,
}

impl SpoolIngestClient {
    pub fn new(spool_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let spool_dir = spool_dir.into();
        std::fs::create_dir_all(&spool_dir)?;
        Ok(Self { spool_dir })
    }
}

impl IngestClient for SpoolIngestClient {
    fn submit_artifact(&self, request: &ArtifactRequest) -> std::result::Result<(), IngestError> {
        let file_name = request
            .path
            .file_name()
            .ok_or_else(|| IngestError(format!("artifact path has no file name: {}", request.path.display())))?;
        let dest = self.spool_dir.join(file_name);
        std::fs::copy(&request.path, &dest)
            .map_err(|e| IngestError(format!("spool copy to {} failed: {e}", dest.display())))?;
        Ok(())
    }
}

/// Reject sink that only logs. Used when no forwarding transport is wired up
/// but rejected records should not kill the partition.
pub struct LogRejectSink;

impl RejectSink for LogRejectSink {
    fn forward(
        &self,
        topic: &str,
        partition: i32,
        first_offset: i64,
        last_offset: i64,
        reason: &str,
        _payload: Option<&[u8]>,
    ) -> std::result::Result<(), IngestError> {
        log::warn!("rejected {topic}-{partition} offsets {first_offset}..={last_offset}: {reason}");
        Ok(())
    }
}
