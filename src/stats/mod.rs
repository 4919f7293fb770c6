//! Operation counters shared by callers and workers.
//!
//! Every counter is an independent atomic, so concurrent [`StatsAggregator::record`]
//! calls never lose updates. A snapshot reads each field atomically; it does
//! not freeze all fields at one instant.

pub mod latency;

pub use latency::{LatencyPercentiles, LatencyTracker};

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of a counted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Read => "retrieve",
            OpKind::Write => "store",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_ops: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub delete_ops: u64,
    pub failed_ops: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Mean backend latency over all timed operations, in microseconds.
    pub avg_latency_us: f64,
}

/// Lock-free statistics aggregator.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    total_ops: AtomicU64,
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    delete_ops: AtomicU64,
    failed_ops: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one finished operation.
    ///
    /// `bytes` only counts towards the byte totals when the operation
    /// succeeded and is a read or a write.
    pub fn record(&self, kind: OpKind, success: bool, bytes: usize) {
        let bytes = bytes as u64;

        match kind {
            OpKind::Read => {
                self.read_ops.fetch_add(1, Ordering::Relaxed);
                if success {
                    self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
                }
            }
            OpKind::Write => {
                self.write_ops.fetch_add(1, Ordering::Relaxed);
                if success {
                    self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                }
            }
            OpKind::Delete => {
                self.delete_ops.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !success {
            self.failed_ops.fetch_add(1, Ordering::Relaxed);
        }
        self.total_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_ops: self.total_ops.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            delete_ops: self.delete_ops.load(Ordering::Relaxed),
            failed_ops: self.failed_ops.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            avg_latency_us: 0.0,
        }
    }

    /// Zeroes every counter. Callers must not race this with `record`.
    pub fn reset(&self) {
        self.total_ops.store(0, Ordering::Relaxed);
        self.read_ops.store(0, Ordering::Relaxed);
        self.write_ops.store(0, Ordering::Relaxed);
        self.delete_ops.store(0, Ordering::Relaxed);
        self.failed_ops.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}
