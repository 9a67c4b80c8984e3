//! Sink orchestration.
//!
//! Maps partition assignment/revocation callbacks from the upstream
//! consumption layer onto partition writers, dispatches records, and answers
//! the periodic safe-to-commit query. Each writer sits behind its own mutex;
//! that mutex is the single serialization point shared by the record path and
//! the flush scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SinkConfig;
use crate::error::{Error, Result};
use crate::flush::{FlushScheduler, WriterMap};
use crate::ingest::{IngestClient, IngestionHandoff, RejectSink, RetryPolicy};
use crate::policy::ThresholdPolicy;
use crate::record::{PartitionKey, SinkRecord};
use crate::writer::PartitionWriter;

/// Bound on waiting out in-flight handoffs at close time.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Sink {
    config: SinkConfig,
    writers: WriterMap,
    handoff: Arc<IngestionHandoff>,
    reject: Option<Arc<dyn RejectSink>>,
    scheduler: Option<FlushScheduler>,
}

impl Sink {
    /// Build the sink and start its background flush scheduler.
    pub fn new(
        config: SinkConfig,
        client: Arc<dyn IngestClient>,
        reject: Option<Arc<dyn RejectSink>>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.temp_dir).map_err(|source| Error::Write {
            path: config.temp_dir.clone(),
            source,
        })?;

        let retry = RetryPolicy::new(config.max_ingest_attempts, config.ingest_backoff());
        let handoff = Arc::new(IngestionHandoff::new(client, reject.clone(), retry));
        let writers: WriterMap = Arc::new(Mutex::new(HashMap::new()));
        let scheduler = FlushScheduler::start(Arc::clone(&writers), config.flush_interval());

        Ok(Self {
            config,
            writers,
            handoff,
            reject,
            scheduler: Some(scheduler),
        })
    }

    /// Partition assignment callback: create and open a writer.
    pub fn open_partition(&self, key: PartitionKey) -> Result<()> {
        let target = self
            .config
            .target_for(&key.topic)
            .ok_or_else(|| Error::InvalidConfig(format!("no ingestion target for topic '{}'", key.topic)))?
            .clone();

        let mut writers = self.writers.lock().expect("writer map lock poisoned");
        if writers.contains_key(&key) {
            return Err(Error::AlreadyOpen);
        }

        let policy = ThresholdPolicy::new(self.config.max_file_bytes, self.config.flush_interval());
        let mut writer = PartitionWriter::new(
            key.clone(),
            target,
            policy,
            &self.config.temp_dir,
            Arc::clone(&self.handoff),
            self.reject.clone(),
            CLOSE_TIMEOUT,
        )?;
        writer.open()?;
        writers.insert(key, Arc::new(Mutex::new(writer)));
        Ok(())
    }

    /// Partition revocation callback: flush and tear down the writer.
    pub fn close_partition(&self, key: &PartitionKey) -> Result<()> {
        let writer = {
            let mut writers = self.writers.lock().expect("writer map lock poisoned");
            writers
                .remove(key)
                .ok_or_else(|| Error::UnknownPartition(key.to_string()))?
        };
        let mut writer = writer.lock().expect("writer lock poisoned");
        writer.close()
    }

    fn writer_for(&self, key: &PartitionKey) -> Option<Arc<Mutex<PartitionWriter>>> {
        self.writers
            .lock()
            .expect("writer map lock poisoned")
            .get(key)
            .cloned()
    }

    /// Dispatch one record to its partition writer.
    pub fn write(&self, record: SinkRecord) -> Result<()> {
        let writer = self
            .writer_for(&record.key())
            .ok_or_else(|| Error::UnknownPartition(record.key().to_string()))?;
        let mut writer = writer.lock().expect("writer lock poisoned");
        writer.write_record(&record)
    }

    /// The upstream layer's periodic precommit query: highest offset durably
    /// handed off for this partition, if any.
    pub fn safe_to_commit(&self, key: &PartitionKey) -> Result<Option<i64>> {
        let writer = self
            .writer_for(key)
            .ok_or_else(|| Error::UnknownPartition(key.to_string()))?;
        let writer = writer.lock().expect("writer lock poisoned");
        Ok(writer.last_committed_offset())
    }

    /// Run `f` against a partition's writer. Used by the CLI and tests for
    /// diagnostics like the artifact path preview.
    pub fn with_writer<T>(
        &self,
        key: &PartitionKey,
        f: impl FnOnce(&mut PartitionWriter) -> T,
    ) -> Result<T> {
        let writer = self
            .writer_for(key)
            .ok_or_else(|| Error::UnknownPartition(key.to_string()))?;
        let mut writer = writer.lock().expect("writer lock poisoned");
        Ok(f(&mut writer))
    }

    /// Graceful shutdown: stop the flush scheduler, close every writer
    /// (flushing non-empty buffers), then drain the handoff worker.
    ///
    /// The first writer error is returned after all partitions have been
    /// attempted.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }

        let writers: Vec<_> = {
            let mut map = self.writers.lock().expect("writer map lock poisoned");
            map.drain().collect()
        };

        let mut first_err = None;
        for (key, writer) in writers {
            let mut writer = writer.lock().expect("writer lock poisoned");
            if let Err(err) = writer.close() {
                log::error!("{key}: close failed: {err}");
                first_err.get_or_insert(err);
            }
        }

        self.handoff.shutdown(CLOSE_TIMEOUT);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
