use std::path::PathBuf;

/// Errors surfaced by the sink.
///
/// The three failure families drive different recovery paths:
///
/// - `Serialization`: one bad record. Forwarded to the reject sink and the
///   partition keeps going; fatal only when no reject sink is configured.
/// - `Write`: local artifact storage failed. Always fatal to the partition
///   so it can be torn down and reassigned.
/// - `Ingestion`: the remote handoff exhausted its retries with no reject
///   sink configured. Fatal to the partition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("artifact write failed at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ingestion failed: {0}")]
    Ingestion(String),

    #[error("partition {0} has failed and no longer accepts records")]
    PartitionFailed(String),

    #[error("writer is not open")]
    NotOpen,

    #[error("writer is already open")]
    AlreadyOpen,

    #[error("no partition writer for {0}")]
    UnknownPartition(String),

    #[error("seal called with no open artifact")]
    AlreadySealed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
