//! Rolling artifact buffer.
//!
//! Accumulates encoded record bytes into one gzip file per open batch. The
//! artifact name is fixed at open time and deterministically encodes the
//! partition identity and an offset marker, so a crashed writer re-fed the
//! same records regenerates the same artifact identity for idempotent
//! re-ingestion.
//!
//! An open artifact is written to a `.tmp` sibling and atomically renamed to
//! its final name at seal time, so the ingestion handoff only ever sees
//! complete files. The buffer is mutated only through its owning partition
//! writer; the flush timer never writes bytes, it only triggers a roll
//! decision upstream.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::encode::Format;
use crate::error::{Error, Result};
use crate::record::PartitionKey;

const TMP_SUFFIX: &str = ".tmp";

/// An in-progress batch artifact: gzip stream plus raw-byte accounting.
struct OpenArtifact {
    /// Final (published) path; the artifact's identity.
    path: PathBuf,
    /// Temp path the bytes are written to until seal.
    tmp_path: PathBuf,
    gz: GzEncoder<File>,
    raw_bytes: u64,
    opened_at: Instant,
    marker: i64,
}

/// A sealed batch artifact whose ownership transfers to the ingestion
/// handoff.
#[derive(Debug, Clone)]
pub struct SealedArtifact {
    pub path: PathBuf,
    /// Uncompressed byte count, as reported to the ingestion service.
    pub raw_bytes: u64,
    pub format: Format,
    /// Offset marker embedded in the artifact name.
    pub marker: i64,
}

/// Accumulates serialized records for one partition into rolling gzip
/// artifacts.
pub struct RollingBuffer {
    dir: PathBuf,
    key: PartitionKey,
    format: Format,
    current: Option<OpenArtifact>,
}

impl RollingBuffer {
    /// Create the buffer and its partition-private temp subtree, sweeping
    /// any stale `.tmp` leftovers from a previous run.
    pub fn new(temp_root: &Path, key: PartitionKey, format: Format) -> Result<Self> {
        let dir = temp_root.join(key.dir_name());
        std::fs::create_dir_all(&dir).map_err(|source| Error::Write {
            path: dir.clone(),
            source,
        })?;
        remove_stale_temps(&dir);
        Ok(Self {
            dir,
            key,
            format,
            current: None,
        })
    }

    /// Deterministic artifact path for a given offset marker.
    ///
    /// `{topic}_{partition}_{marker}.{format}.gz` inside the partition
    /// subtree.
    pub fn artifact_path(&self, marker: i64) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.{}.gz",
            self.key.topic,
            self.key.partition,
            marker,
            self.format.extension()
        ))
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Raw (uncompressed) bytes accumulated in the open artifact.
    pub fn raw_bytes(&self) -> u64 {
        self.current.as_ref().map_or(0, |a| a.raw_bytes)
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.current.as_ref().map(|a| a.opened_at)
    }

    /// Fixed (final) path of the currently open artifact, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|a| a.path.as_path())
    }

    /// Offset marker of the currently open artifact, if any.
    pub fn current_marker(&self) -> Option<i64> {
        self.current.as_ref().map(|a| a.marker)
    }

    /// Open a new empty artifact named with `marker`.
    pub fn open(&mut self, marker: i64, now: Instant) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let path = self.artifact_path(marker);
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_path);
        let file = File::create(&tmp_path).map_err(|source| Error::Write {
            path: tmp_path.clone(),
            source,
        })?;
        log::debug!("{}: opened artifact {}", self.key, path.display());
        self.current = Some(OpenArtifact {
            path,
            tmp_path,
            gz: GzEncoder::new(file, Compression::default()),
            raw_bytes: 0,
            opened_at: now,
            marker,
        });
        Ok(())
    }

    /// Append encoded record bytes, returning the new raw byte count.
    ///
    /// # Errors
    ///
    /// `Error::Write` if the underlying storage fails; this is fatal to the
    /// partition. `Error::NotOpen` if no artifact is open (writer bug).
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let artifact = self.current.as_mut().ok_or(Error::NotOpen)?;
        artifact.gz.write_all(bytes).map_err(|source| Error::Write {
            path: artifact.tmp_path.clone(),
            source,
        })?;
        artifact.raw_bytes += bytes.len() as u64;
        Ok(artifact.raw_bytes)
    }

    /// Flush, publish and hand off the current artifact.
    ///
    /// The gzip stream is finished, synced, and atomically renamed from its
    /// `.tmp` name to the final artifact name. Sealing without an open
    /// artifact is a reported programming error, never silently ignored.
    pub fn seal(&mut self) -> Result<SealedArtifact> {
        let artifact = self.current.take().ok_or(Error::AlreadySealed)?;
        let file = artifact.gz.finish().map_err(|source| Error::Write {
            path: artifact.tmp_path.clone(),
            source,
        })?;
        file.sync_all().map_err(|source| Error::Write {
            path: artifact.tmp_path.clone(),
            source,
        })?;
        drop(file);
        std::fs::rename(&artifact.tmp_path, &artifact.path).map_err(|source| Error::Write {
            path: artifact.path.clone(),
            source,
        })?;
        log::debug!(
            "{}: sealed artifact {} ({} raw bytes)",
            self.key,
            artifact.path.display(),
            artifact.raw_bytes
        );
        Ok(SealedArtifact {
            path: artifact.path,
            raw_bytes: artifact.raw_bytes,
            format: self.format,
            marker: artifact.marker,
        })
    }

    /// Drop an empty artifact without submitting it (graceful close path).
    pub fn discard(&mut self) {
        if let Some(artifact) = self.current.take() {
            drop(artifact.gz);
            let _ = std::fs::remove_file(&artifact.tmp_path);
        }
    }
}

/// Remove `.tmp` leftovers from a crashed writer; redelivery will regenerate
/// their contents under the same final names.
fn remove_stale_temps(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TMP_SUFFIX))
        {
            log::warn!("removing stale artifact temp {}", path.display());
            let _ = std::fs::remove_file(&path);
        }
    }
}
