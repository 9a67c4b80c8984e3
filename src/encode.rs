//! Serialization formats and encoders.
//!
//! The encoder is picked once per partition writer from the topic's ingestion
//! target, never per record. Text formats own the record separator (a
//! trailing newline) so that a sealed artifact is exactly the concatenation
//! of encoded records; byte passthrough adds nothing.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::RecordValue;

/// Batch file format understood by the ingestion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    Json,
    Avro,
}

impl Format {
    /// File extension embedded in the artifact name (before `.gz`).
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
            Format::Avro => "avro",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Closed dispatch over the supported record encoders.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    format: Format,
}

impl Encoder {
    pub fn new(format: Format) -> Self {
        Self { format }
    }

    /// Encode one record value into artifact bytes.
    ///
    /// # Errors
    ///
    /// `Error::Serialization` when the value cannot be rendered in this
    /// format (e.g. raw bytes into a text format, or text into Avro, which
    /// expects pre-encoded container bytes).
    pub fn encode(&self, value: &RecordValue) -> Result<Vec<u8>> {
        match (self.format, value) {
            // Pre-rendered lines pass through both text formats.
            (Format::Csv, RecordValue::Text(line)) | (Format::Json, RecordValue::Text(line)) => {
                let mut bytes = Vec::with_capacity(line.len() + 1);
                bytes.extend_from_slice(line.as_bytes());
                bytes.push(b'\n');
                Ok(bytes)
            }
            (Format::Csv, RecordValue::Json(value)) => encode_csv_row(value),
            (Format::Json, RecordValue::Json(value)) => {
                let mut bytes = serde_json::to_vec(value)
                    .map_err(|e| Error::Serialization(format!("json encode: {e}")))?;
                bytes.push(b'\n');
                Ok(bytes)
            }
            (Format::Avro, RecordValue::Bytes(bytes)) => Ok(bytes.clone()),
            (format, value) => Err(Error::Serialization(format!(
                "cannot encode {} value as {format}",
                value.kind()
            ))),
        }
    }
}

/// Render a structured value as one quoted CSV row.
///
/// Objects encode their values in key order, arrays their elements in order,
/// scalars as a single-field row.
fn encode_csv_row(value: &serde_json::Value) -> Result<Vec<u8>> {
    let fields: Vec<String> = match value {
        serde_json::Value::Object(map) => map.values().map(render_scalar).collect::<Result<_>>()?,
        serde_json::Value::Array(items) => items.iter().map(render_scalar).collect::<Result<_>>()?,
        scalar => vec![render_scalar(scalar)?],
    };

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record(&fields)
        .and_then(|_| writer.flush().map_err(csv::Error::from))
        .map_err(|e| Error::Serialization(format!("csv encode: {e}")))?;
    writer
        .into_inner()
        .map_err(|e| Error::Serialization(format!("csv encode: {e}")))
}

fn render_scalar(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::String(s) => Ok(s.clone()),
        nested => Err(Error::Serialization(format!(
            "nested value {nested} cannot be a csv field"
        ))),
    }
}
