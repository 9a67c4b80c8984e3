use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use tempfile::tempdir;

use sluice::{
    ArtifactRequest, AuthConfig, Error, Format, IngestClient, IngestError, IngestionTarget,
    PartitionKey, RecordValue, RejectSink, Sink, SinkConfig, SinkRecord,
};

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

#[derive(Default)]
struct CapturingReject {
    forwarded: Mutex<Vec<i64>>,
}

impl RejectSink for CapturingReject {
    fn forward(
        &self,
        _topic: &str,
        _partition: i32,
        first_offset: i64,
        _last_offset: i64,
        _reason: &str,
        _payload: Option<&[u8]>,
    ) -> Result<(), IngestError> {
        self.forwarded.lock().expect("forwarded lock").push(first_offset);
        Ok(())
    }
}

fn config(temp_dir: &Path, max_file_bytes: u64) -> SinkConfig {
    let mut topics = HashMap::new();
    topics.insert(
        "trades".to_string(),
        IngestionTarget {
            database: "testdb1".into(),
            table: "testtable1".into(),
            format: Format::Csv,
        },
    );
    topics.insert(
        "telemetry".to_string(),
        IngestionTarget {
            database: "testdb2".into(),
            table: "testtable2".into(),
            format: Format::Avro,
        },
    );
    SinkConfig {
        endpoint_url: "https://ingest-cluster.example.net".into(),
        auth: AuthConfig {
            app_id: "some-appid".into(),
            app_key: "some-appkey".into(),
            authority: "some-authority".into(),
        },
        temp_dir: temp_dir.to_path_buf(),
        max_file_bytes,
        flush_interval_ms: 300_000,
        max_ingest_attempts: 3,
        ingest_backoff_ms: 5,
        topics,
        reject: None,
    }
}

fn text_record(topic: &str, partition: i32, offset: i64, line: &str) -> SinkRecord {
    SinkRecord::new(topic, partition, offset, RecordValue::Text(line.into()))
}

fn wait_for_commit(sink: &Sink, key: &PartitionKey, expect: i64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if sink.safe_to_commit(key).expect("commit query") == Some(expect) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "offset {expect} was not committed in time"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn close_partition_flushes_buffered_records() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(CapturingClient::default());
    let sink = Sink::new(
        config(dir.path(), 1024 * 1024),
        Arc::clone(&client) as Arc<dyn IngestClient>,
        None,
    )
    .expect("sink");

    let key = PartitionKey::new("trades", 0);
    sink.open_partition(key.clone()).expect("open partition");
    sink.write(text_record("trades", 0, 0, "hello world")).expect("write");
    sink.write(text_record("trades", 0, 1, "hello again")).expect("write");

    // Below both thresholds: nothing has been handed off yet.
    assert_eq!(sink.safe_to_commit(&key).expect("commit query"), None);
    let preview = sink
        .with_writer(&key, |w| w.file_path(None))
        .expect("preview");
    assert_eq!(
        preview.file_name().expect("name").to_str().expect("utf8"),
        "trades_0_2.csv.gz"
    );

    sink.close_partition(&key).expect("close partition");
    {
        let submissions = client.submissions.lock().expect("submissions lock");
        assert_eq!(submissions.len(), 1);
        let (request, raw) = &submissions[0];
        assert_eq!(
            request.path.file_name().expect("name").to_str().expect("utf8"),
            "trades_0_0.csv.gz"
        );
        assert_eq!(request.size_bytes, 24);
        assert_eq!(raw, b"hello world\nhello again\n");
    }

    // The partition is gone after revocation.
    assert!(matches!(
        sink.safe_to_commit(&key).unwrap_err(),
        Error::UnknownPartition(_)
    ));
    sink.close().expect("sink close");
}

#[test]
fn unknown_partitions_and_unmapped_topics_are_reported() {
    let dir = tempdir().expect("tempdir");
    let sink = Sink::new(
        config(dir.path(), 1024),
        Arc::new(CapturingClient::default()) as Arc<dyn IngestClient>,
        None,
    )
    .expect("sink");

    assert!(matches!(
        sink.write(text_record("trades", 0, 0, "x")).unwrap_err(),
        Error::UnknownPartition(_)
    ));
    assert!(matches!(
        sink.open_partition(PartitionKey::new("unmapped", 0)).unwrap_err(),
        Error::InvalidConfig(_)
    ));
    assert!(matches!(
        sink.close_partition(&PartitionKey::new("trades", 7)).unwrap_err(),
        Error::UnknownPartition(_)
    ));

    let key = PartitionKey::new("trades", 0);
    sink.open_partition(key.clone()).expect("open partition");
    assert!(matches!(
        sink.open_partition(key).unwrap_err(),
        Error::AlreadyOpen
    ));
    sink.close().expect("sink close");
}

#[test]
fn sink_close_flushes_every_partition() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(CapturingClient::default());
    let sink = Sink::new(
        config(dir.path(), 1024 * 1024),
        Arc::clone(&client) as Arc<dyn IngestClient>,
        None,
    )
    .expect("sink");

    for partition in [0, 1] {
        sink.open_partition(PartitionKey::new("trades", partition))
            .expect("open partition");
        sink.write(text_record("trades", partition, 0, "leftover"))
            .expect("write");
    }
    sink.close().expect("sink close");

    let submissions = client.submissions.lock().expect("submissions lock");
    let mut names: Vec<String> = submissions
        .iter()
        .map(|(request, _)| {
            request
                .path
                .file_name()
                .expect("name")
                .to_str()
                .expect("utf8")
                .to_string()
        })
        .collect();
    names.sort();
    assert_eq!(names, ["trades_0_0.csv.gz", "trades_1_0.csv.gz"]);
}

#[test]
fn rejected_record_does_not_stop_the_partition() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(CapturingClient::default());
    let reject = Arc::new(CapturingReject::default());
    let sink = Sink::new(
        config(dir.path(), 1000),
        Arc::clone(&client) as Arc<dyn IngestClient>,
        Some(Arc::clone(&reject) as Arc<dyn RejectSink>),
    )
    .expect("sink");

    let key = PartitionKey::new("telemetry", 4);
    sink.open_partition(key.clone()).expect("open partition");

    // Text into a byte-passthrough topic cannot be encoded.
    sink.write(text_record("telemetry", 4, 3, "not avro")).expect("write");
    assert_eq!(*reject.forwarded.lock().expect("forwarded lock"), vec![3]);

    // The partition keeps flowing; a large record crosses the threshold.
    let record = SinkRecord::new("telemetry", 4, 4, RecordValue::Bytes(vec![1u8; 2000]));
    sink.write(record).expect("write");
    wait_for_commit(&sink, &key, 4);

    assert_eq!(client.submissions.lock().expect("submissions lock").len(), 1);
    sink.close().expect("sink close");
}
