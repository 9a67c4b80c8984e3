//! Sink configuration.
//!
//! Loaded from JSON, validated once at startup. The sink itself treats the
//! config as read-only; per-partition threshold settings are copied into each
//! writer at construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encode::Format;
use crate::error::{Error, Result};

/// Ingestion target for one topic: where batches land and in which format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionTarget {
    pub database: String,
    pub table: String,
    /// Batch format, fixed per topic.
    /// Default: csv
    #[serde(default = "default_format")]
    pub format: Format,
}

fn default_format() -> Format {
    Format::Csv
}

/// Credentials for the remote ingestion endpoint.
///
/// Validated for presence only; authentication itself happens inside the
/// ingest client implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub app_id: String,
    pub app_key: String,
    pub authority: String,
}

/// Reject-sink target for records and batches that cannot be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectConfig {
    /// Destination topic for forwarded failures.
    pub topic: String,
}

/// Top-level sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Remote bulk-ingestion endpoint URL.
    pub endpoint_url: String,

    /// Endpoint credentials.
    pub auth: AuthConfig,

    /// Root of the local temp directory. Each partition gets its own
    /// subtree underneath.
    pub temp_dir: PathBuf,

    /// Size threshold: roll the artifact once accumulated raw bytes reach
    /// this value.
    /// Default: 64 MB
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Time threshold in milliseconds: roll a non-empty artifact that has
    /// been open this long. Also the flush scheduler period.
    /// Default: 300 000 (5 minutes)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Maximum handoff attempts per artifact before the batch is forwarded
    /// to the reject sink (or the partition fails).
    /// Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_ingest_attempts: u32,

    /// Initial handoff retry backoff in milliseconds; doubles per attempt.
    /// Default: 500
    #[serde(default = "default_backoff_ms")]
    pub ingest_backoff_ms: u64,

    /// Per-topic ingestion targets.
    pub topics: HashMap<String, IngestionTarget>,

    /// Reject sink, if enabled.
    #[serde(default)]
    pub reject: Option<RejectConfig>,
}

fn default_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl SinkConfig {
    /// Parse a JSON config document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SinkConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the rest of the sink relies on.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_url.is_empty() {
            return Err(Error::InvalidConfig("endpoint_url is empty".into()));
        }
        if self.auth.app_id.is_empty() || self.auth.app_key.is_empty() {
            return Err(Error::InvalidConfig("auth credentials are empty".into()));
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("temp_dir is empty".into()));
        }
        if self.max_file_bytes == 0 {
            return Err(Error::InvalidConfig("max_file_bytes must be > 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::InvalidConfig("flush_interval_ms must be > 0".into()));
        }
        if self.max_ingest_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_ingest_attempts must be > 0".into(),
            ));
        }
        if self.topics.is_empty() {
            return Err(Error::InvalidConfig("no topics configured".into()));
        }
        for (topic, target) in &self.topics {
            if target.database.is_empty() || target.table.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "topic '{topic}' has an empty database/table mapping"
                )));
            }
        }
        Ok(())
    }

    /// Ingestion target for a topic, if mapped.
    pub fn target_for(&self, topic: &str) -> Option<&IngestionTarget> {
        self.topics.get(topic)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn ingest_backoff(&self) -> Duration {
        Duration::from_millis(self.ingest_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{
            "endpoint_url": "https://ingest-cluster.example.net",
            "auth": {"app_id": "some-appid", "app_key": "some-appkey", "authority": "some-authority"},
            "temp_dir": "/tmp/sluice",
            "topics": {
                "trades": {"database": "testdb1", "table": "testtable1", "format": "csv"}
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_config_defaults() {
        let config = SinkConfig::from_json(&sample_json()).unwrap();
        assert_eq!(config.max_file_bytes, 64 * 1024 * 1024);
        assert_eq!(config.flush_interval_ms, 300_000);
        assert_eq!(config.max_ingest_attempts, 3);
        assert!(config.reject.is_none());
        assert_eq!(
            config.target_for("trades").unwrap().format,
            Format::Csv
        );
        assert!(config.target_for("unmapped").is_none());
    }

    #[test]
    fn test_config_rejects_zero_threshold() {
        let mut config = SinkConfig::from_json(&sample_json()).unwrap();
        config.max_file_bytes = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            Error::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_config_rejects_empty_mapping() {
        let mut config = SinkConfig::from_json(&sample_json()).unwrap();
        config.topics.insert(
            "bad".into(),
            IngestionTarget {
                database: String::new(),
                table: "t".into(),
                format: Format::Json,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let config = SinkConfig::from_json(&sample_json()).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: SinkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.endpoint_url, config.endpoint_url);
        assert_eq!(back.topics.len(), 1);
    }
}
