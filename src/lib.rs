//! Partitioned stream-to-batch ingestion sink.
//!
//! Converts a continuous, partitioned record stream into rolling gzip batch
//! artifacts and hands them off to a remote bulk-ingestion service. Artifacts
//! roll on size or age, names deterministically encode partition identity and
//! a starting-offset marker, and delivery progress is tracked so the upstream
//! layer only commits offsets that were durably handed off.

pub mod buffer;
pub mod config;
pub mod encode;
pub mod error;
pub mod flush;
pub mod ingest;
pub mod policy;
pub mod record;
pub mod sink;
pub mod writer;

pub use buffer::{RollingBuffer, SealedArtifact};
pub use config::{AuthConfig, IngestionTarget, RejectConfig, SinkConfig};
pub use encode::{Encoder, Format};
pub use error::{Error, Result};
pub use ingest::{
    ArtifactRequest, IngestClient, IngestError, IngestionHandoff, IngestionTask, LogRejectSink,
    PartitionFault, RejectSink, RetryPolicy, SpoolIngestClient,
};
pub use policy::ThresholdPolicy;
pub use record::{OffsetTracker, PartitionKey, RecordValue, SinkRecord};
pub use sink::Sink;
pub use writer::PartitionWriter;
