//! Usage Recorder
//!
//! Single-writer append-only JSONL sink plus in-process aggregates. All
//! appends serialize through one mutex so two events can never interleave
//! into one malformed line; each append is flushed before the lock drops.
//!
//! Log failures are isolated: a failed write lands in a bounded retry
//! buffer drained on the next successful append, and overflow drops the
//! oldest line while bumping an observable counter. Request processing
//! never blocks on or fails from the log.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

use crate::lane::Lane;
use crate::usage::events::{DecisionEvent, UsageEvent};

/// Maximum lines held while the sink is unavailable
const MAX_PENDING_LINES: usize = 1024;

#[derive(Debug)]
struct LogSink {
    file: File,
    pending: VecDeque<String>,
}

#[derive(Debug, Default, Clone)]
struct LaneModelCounters {
    requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    errors: u64,
}

/// Aggregate counters for one (lane, model) pair
///
/// Process-lifetime only; not durable across restarts.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub lane: Lane,
    pub model: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: u64,
}

/// Durable event log and aggregate counter table
#[derive(Debug)]
pub struct UsageRecorder {
    sink: Mutex<LogSink>,
    aggregates: Mutex<HashMap<(Lane, String), LaneModelCounters>>,
    dropped: AtomicU64,
}

impl UsageRecorder {
    /// Open (or create) the append-only log file
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Mutex::new(LogSink {
                file,
                pending: VecDeque::new(),
            }),
            aggregates: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Append a decision record; best-effort, never fails the caller
    pub fn record_decision(&self, event: &DecisionEvent) {
        self.append(event);
    }

    /// Append a completion record and fold it into the aggregates
    pub fn record_usage(&self, event: &UsageEvent) {
        self.append(event);

        let mut aggregates = self.aggregates.lock().expect("aggregate lock poisoned");
        let counters = aggregates
            .entry((event.lane, event.model.clone()))
            .or_default();
        counters.requests += 1;
        counters.input_tokens += event.input_tokens;
        counters.output_tokens += event.output_tokens;
        if event.status == 0 || event.status >= 400 {
            counters.errors += 1;
        }
    }

    // Serialize and write one line under the sink lock, draining any
    // buffered lines first so ordering within the buffer is preserved.
    fn append<T: Serialize>(&self, event: &T) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to serialize usage event");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mut guard = self.sink.lock().expect("log sink lock poisoned");
        let sink = &mut *guard;

        while let Some(buffered) = sink.pending.front() {
            if Self::write_line(&mut sink.file, buffered).is_err() {
                return Self::buffer_line(sink, line, &self.dropped);
            }
            sink.pending.pop_front();
        }

        if Self::write_line(&mut sink.file, &line).is_err() {
            Self::buffer_line(sink, line, &self.dropped);
        }
    }

    fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }

    fn buffer_line(sink: &mut LogSink, line: String, dropped: &AtomicU64) {
        if sink.pending.len() >= MAX_PENDING_LINES {
            sink.pending.pop_front();
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total, "usage log buffer full, dropped oldest event");
        }
        sink.pending.push_back(line);
    }

    /// Events dropped because the sink was unavailable too long
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current aggregate counters, sorted for stable rendering
    pub fn aggregates(&self) -> Vec<AggregateSnapshot> {
        let aggregates = self.aggregates.lock().expect("aggregate lock poisoned");
        let mut out: Vec<AggregateSnapshot> = aggregates
            .iter()
            .map(|((lane, model), c)| AggregateSnapshot {
                lane: *lane,
                model: model.clone(),
                requests: c.requests,
                input_tokens: c.input_tokens,
                output_tokens: c.output_tokens,
                errors: c.errors,
            })
            .collect();
        out.sort_by(|a, b| (a.lane.as_str(), &a.model).cmp(&(b.lane.as_str(), &b.model)));
        out
    }
}
