//! Event trace collection and export.
//!
//! When tracing is enabled the kernel records one row per event reaching the
//! head of the queue, including events that were canceled in flight. The
//! table is exported as JSON on termination, and unconditionally when a run
//! aborts on an invariant violation, so a failed seed can be replayed and
//! diffed offline.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// One executed (or skipped) event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRow {
    /// Tick at which the event reached the head of the queue.
    pub time: u64,
    /// Name of the owning node, or `maintainer` / `environment`.
    pub location: String,
    /// Snake-case action name.
    pub action: String,
    /// Diagnostic tag recorded at scheduling time.
    pub source: String,
    /// User-assigned priority.
    pub priority: i32,
    /// Empty for executed events, `canceled` for skipped ones.
    pub status: String,
    /// Monotonic dequeue index.
    pub index: u64,
}

/// In-memory event trace for one replication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTrace {
    rows: Vec<TraceRow>,
}

impl EventTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one dequeued event.
    pub fn record(&mut self, event: &Event, location: &str, canceled: bool, index: u64) {
        self.rows.push(TraceRow {
            time: event.time,
            location: location.to_owned(),
            action: event.action.name().to_owned(),
            source: event.source.clone(),
            priority: event.priority,
            status: if canceled { "canceled".to_owned() } else { String::new() },
            index,
        });
    }

    pub fn rows(&self) -> &[TraceRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes the trace as pretty-printed JSON.
    pub fn export_json(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.rows).map_err(io::Error::from)
    }
}
