//! Event sinks.
//!
//! A sink receives one [`EventRecord`] per processed event, in processing
//! order. Recording never fails the caller: sinks that perform I/O catch
//! their own errors, log them and count them.

use lamport_types::{EventRecord, MachineId};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Destination for event records.
pub trait EventSink: Send + Sync {
    /// Append one record. Must not panic or block for long.
    fn record(&self, record: &EventRecord);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn record(&self, record: &EventRecord) {
        (**self).record(record)
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn record(&self, record: &EventRecord) {
        (**self).record(record)
    }
}

/// Errors writing a record. Caught inside the sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, record: &EventRecord) {
        info!(
            machine = record.machine.get(),
            kind = record.kind.label(),
            clock = record.logical_clock,
            queue_len = record.queue_len_after(),
            drift = record.drift(),
            undelivered = record.undelivered.len(),
            system_time_ms = record.system_time_ms,
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Number of records so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn record(&self, record: &EventRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
    failures: AtomicU64,
}

impl JsonLinesSink {
    /// Open (or create) `path` for appending.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(LineWriter::new(file)),
            failures: AtomicU64::new(0),
        })
    }

    /// Open `machine_<id>.jsonl` inside `dir`, creating the directory if needed.
    pub fn in_dir(dir: impl AsRef<Path>, machine: MachineId) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Self::create(dir.as_ref().join(format!("machine_{}.jsonl", machine.get())))
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records that could not be written.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn try_record(&self, record: &EventRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.lock().write_all(&line)?;
        Ok(())
    }
}

impl EventSink for JsonLinesSink {
    fn record(&self, record: &EventRecord) {
        if let Err(e) = self.try_record(record) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                machine = record.machine.get(),
                path = %self.path.display(),
                error = %e,
                "Failed to write event record"
            );
        }
    }
}

/// Forwards every record to each inner sink, in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn record(&self, record: &EventRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}
