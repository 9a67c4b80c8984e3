//! Background flush scheduler.
//!
//! A timer thread, independent of record arrival, that periodically asks
//! every active partition writer to evaluate its time-based roll threshold.
//! Ticks go through the same per-partition mutex as the record path, so a
//! tick and an append are mutually exclusive on any given partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::record::PartitionKey;
use crate::writer::PartitionWriter;

pub(crate) type WriterMap = Arc<Mutex<HashMap<PartitionKey, Arc<Mutex<PartitionWriter>>>>>;

/// Polling granularity while waiting out the flush period, so shutdown stays
/// responsive even with long periods.
const TICK_POLL: Duration = Duration::from_millis(25);

pub struct FlushScheduler {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Start the timer thread ticking every `period`.
    pub(crate) fn start(writers: WriterMap, period: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("sluice-flush".into())
            .spawn(move || {
                let mut next_tick = Instant::now() + period;
                loop {
                    if thread_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let now = Instant::now();
                    if now < next_tick {
                        thread::sleep(TICK_POLL.min(next_tick - now));
                        continue;
                    }
                    next_tick = now + period;

                    // Snapshot the writer handles so the map lock is not held
                    // across roll evaluation.
                    let snapshot: Vec<Arc<Mutex<PartitionWriter>>> = {
                        let map = writers.lock().expect("writer map lock poisoned");
                        map.values().cloned().collect()
                    };
                    for writer in snapshot {
                        let mut writer = writer.lock().expect("writer lock poisoned");
                        if let Err(err) = writer.evaluate_roll(Instant::now()) {
                            log::error!("{}: flush tick roll failed: {err}", writer.key());
                        }
                    }
                }
            })
            .expect("failed to spawn flush scheduler");

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the timer and join the thread.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
