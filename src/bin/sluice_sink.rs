use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use sluice::{
    LogRejectSink, PartitionKey, RecordValue, RejectSink, Sink, SinkConfig, SinkRecord,
    SpoolIngestClient,
};

/// Feed newline-delimited records from stdin into the sink for one topic
/// partition, spooling sealed artifacts into a local directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON sink configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Topic to attribute the stdin records to (must be mapped in the config)
    #[arg(short, long)]
    topic: String,

    /// Partition index to attribute the stdin records to
    #[arg(short, long, default_value_t = 0)]
    partition: i32,

    /// Offset assigned to the first record
    #[arg(long, default_value_t = 0)]
    start_offset: i64,

    /// Directory sealed artifacts are spooled into
    #[arg(short, long, default_value = "./spool")]
    spool: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let json = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read config {}", args.config.display()))?;
    let config = SinkConfig::from_json(&json).context("invalid sink config")?;

    let client = Arc::new(
        SpoolIngestClient::new(&args.spool)
            .with_context(|| format!("failed to create spool dir {}", args.spool.display()))?,
    );
    let reject: Option<Arc<dyn RejectSink>> = config.reject.as_ref().map(|_| {
        Arc::new(LogRejectSink) as Arc<dyn RejectSink>
    });

    info!("Starting sluice sink");
    info!("Spool: {}", args.spool.display());
    info!("Topic: {}-{}", args.topic, args.partition);

    let sink = Sink::new(config, client, reject).context("failed to start sink")?;
    let key = PartitionKey::new(args.topic.clone(), args.partition);
    sink.open_partition(key.clone())
        .context("failed to open partition")?;

    let stdin = std::io::stdin();
    let mut offset = args.start_offset;
    let mut written = 0u64;
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        let record = SinkRecord::new(
            args.topic.clone(),
            args.partition,
            offset,
            RecordValue::Text(line),
        );
        sink.write(record)
            .with_context(|| format!("failed to write record at offset {offset}"))?;
        offset += 1;
        written += 1;
    }

    let committed = sink.safe_to_commit(&key)?;
    info!("Wrote {written} records, last committed offset: {committed:?}");

    sink.close().context("sink shutdown failed")?;
    info!("Done");
    Ok(())
}
