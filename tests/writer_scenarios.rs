use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::GzDecoder;
use tempfile::tempdir;

use sluice::{
    ArtifactRequest, Format, IngestClient, IngestError, IngestionHandoff, IngestionTarget,
    PartitionKey, PartitionWriter, RecordValue, RetryPolicy, SinkRecord, ThresholdPolicy,
};

/// Captures every submission together with the gunzipped artifact contents,
/// read before the handoff deletes the file.
#[derive(Default)]
struct CapturingClient {
    submissions: Mutex<Vec<(ArtifactRequest, Vec<u8>)>>,
}

impl IngestClient for CapturingClient {
    fn submit_artifact(&self, request: &ArtifactRequest) -> Result<(), IngestError> {
        let file =
            std::fs::File::open(&request.path).map_err(|e| IngestError(e.to_string()))?;
        let mut raw = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut raw)
            .map_err(|e| IngestError(e.to_string()))?;
        self.submissions
            .lock()
            .expect("submissions lock")
            .push((request.clone(), raw));
        Ok(())
    }
}

fn key() -> PartitionKey {
    PartitionKey::new("testTopic", 11)
}

fn writer_with(
    dir: &Path,
    format: Format,
    max_bytes: u64,
    client: Arc<CapturingClient>,
) -> (PartitionWriter, Arc<IngestionHandoff>) {
    let handoff = Arc::new(IngestionHandoff::new(
        client,
        None,
        RetryPolicy::new(3, Duration::from_millis(5)),
    ));
    let mut writer = PartitionWriter::new(
        key(),
        IngestionTarget {
            database: "testdb1".into(),
            table: "testtable1".into(),
            format,
        },
        ThresholdPolicy::new(max_bytes, Duration::from_secs(300)),
        dir,
        Arc::clone(&handoff),
        None,
        Duration::from_secs(5),
    )
    .expect("create writer");
    writer.open().expect("open writer");
    (writer, handoff)
}

fn text_record(offset: i64, line: &str) -> SinkRecord {
    SinkRecord::new("testTopic", 11, offset, RecordValue::Text(line.into()))
}

fn file_name(path: &Path) -> &str {
    path.file_name().expect("file name").to_str().expect("utf8")
}

#[test]
fn size_roll_submits_batch_with_raw_size() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(CapturingClient::default());
    let (mut writer, handoff) = writer_with(dir.path(), Format::Avro, 100, Arc::clone(&client));

    let payload = vec![7u8; 1024];
    let record = SinkRecord::new("testTopic", 11, 10, RecordValue::Bytes(payload.clone()));
    writer.write_record(&record).expect("write");

    assert!(handoff.wait_idle(&key(), Duration::from_secs(5)));
    let submissions = client.submissions.lock().expect("submissions lock");
    assert_eq!(submissions.len(), 1);
    let (request, raw) = &submissions[0];
    assert_eq!(request.size_bytes, 1024);
    assert_eq!(request.database, "testdb1");
    assert_eq!(request.table, "testtable1");
    assert_eq!(request.format, Format::Avro);
    assert_eq!(file_name(&request.path), "testTopic_11_10.avro.gz");
    assert_eq!(raw, &payload);

    // Submitted artifact is cleaned up; the next one is already open under
    // a marker advanced past the sealed one.
    assert!(!request.path.exists());
    assert_eq!(writer.last_committed_offset(), Some(10));
    assert_eq!(writer.current_offset(), 10);
    let open_path = writer.current_artifact_path().expect("open artifact");
    assert_eq!(file_name(open_path), "testTopic_11_11.avro.gz");
}

#[test]
fn roll_includes_crossing_record_and_reopens_at_trigger_offset() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(CapturingClient::default());
    // 10 bytes per encoded line, threshold 40: the fourth record crosses.
    let (mut writer, handoff) = writer_with(dir.path(), Format::Csv, 40, Arc::clone(&client));

    let line = "aaaaaaaaa";
    for offset in [10, 13, 14, 15] {
        writer.write_record(&text_record(offset, line)).expect("write");
    }

    assert!(handoff.wait_idle(&key(), Duration::from_secs(5)));
    {
        let submissions = client.submissions.lock().expect("submissions lock");
        assert_eq!(submissions.len(), 1);
        let (request, raw) = &submissions[0];
        // The first artifact was named lazily from its first record.
        assert_eq!(file_name(&request.path), "testTopic_11_10.csv.gz");
        assert_eq!(request.size_bytes, 40);
        assert_eq!(raw, b"aaaaaaaaa\naaaaaaaaa\naaaaaaaaa\naaaaaaaaa\n");
    }
    assert_eq!(writer.last_committed_offset(), Some(15));
    assert_eq!(writer.current_offset(), 15);

    // The reopened artifact carries the triggering record's offset.
    let open_path = writer.current_artifact_path().expect("open artifact");
    assert_eq!(file_name(open_path), "testTopic_11_15.csv.gz");

    writer.write_record(&text_record(16, line)).expect("write");
    assert_eq!(writer.current_offset(), 16);
    assert_eq!(writer.last_committed_offset(), Some(15));
    // A record in flight moves the preview one past the current offset.
    assert_eq!(file_name(&writer.file_path(None)), "testTopic_11_17.csv.gz");

    writer.close().expect("close");
    let submissions = client.submissions.lock().expect("submissions lock");
    assert_eq!(submissions.len(), 2);
    let (request, raw) = &submissions[1];
    assert_eq!(file_name(&request.path), "testTopic_11_15.csv.gz");
    assert_eq!(request.size_bytes, 10);
    assert_eq!(raw, b"aaaaaaaaa\n");
    assert_eq!(writer.last_committed_offset(), Some(16));
}

#[test]
fn path_preview_fresh_and_dirty() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(CapturingClient::default());
    let (mut writer, _handoff) = writer_with(dir.path(), Format::Csv, 1000, Arc::clone(&client));

    // Fresh writer: no records yet, the preview marker is 0.
    assert_eq!(file_name(&writer.file_path(None)), "testTopic_11_0.csv.gz");
    assert_eq!(
        file_name(&writer.file_path(Some(100))),
        "testTopic_11_100.csv.gz"
    );

    writer.write_record(&text_record(3, "aaaaaaaaa")).expect("write");
    let named_at_open = writer.current_artifact_path().expect("open").to_path_buf();
    assert_eq!(file_name(&named_at_open), "testTopic_11_3.csv.gz");

    writer.write_record(&text_record(4, "aaaaaaaaa")).expect("write");
    // The open artifact's name was fixed at open time.
    assert_eq!(writer.current_artifact_path().expect("open"), named_at_open);
    // The preview moves with the offsets.
    assert_eq!(file_name(&writer.file_path(None)), "testTopic_11_5.csv.gz");

    writer.close().expect("close");
    let submissions = client.submissions.lock().expect("submissions lock");
    assert_eq!(submissions.len(), 1);
    let (request, raw) = &submissions[0];
    assert_eq!(file_name(&request.path), "testTopic_11_3.csv.gz");
    assert_eq!(raw, b"aaaaaaaaa\naaaaaaaaa\n");
    assert_eq!(writer.last_committed_offset(), Some(4));
}

#[test]
fn close_without_records_submits_nothing() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(CapturingClient::default());
    let (mut writer, _handoff) = writer_with(dir.path(), Format::Csv, 1000, Arc::clone(&client));

    writer.close().expect("close");
    assert!(client.submissions.lock().expect("submissions lock").is_empty());
    assert_eq!(writer.last_committed_offset(), None);
}
