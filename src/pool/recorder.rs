//! Slow statement records kept per data source

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::metrics::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlRecord {
    /// Client host
    pub host: String,
    pub schema: Option<String>,
    pub data_node: String,
    pub statement: String,
    pub started_at: SystemTime,
    pub duration: Duration,
}

/// Bounded set of the slowest statements seen.
///
/// Once full, a new record only displaces the fastest one kept, and only if it is slower.
#[derive(Debug)]
pub struct SqlRecorder {
    capacity: usize,
    threshold: Duration,
    records: Mutex<Vec<SqlRecord>>,
}

impl SqlRecorder {
    pub fn new(capacity: usize, threshold: Duration) -> Self {
        Self {
            capacity,
            threshold,
            records: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn record(&self, record: SqlRecord) {
        if self.capacity == 0 || record.duration < self.threshold {
            return;
        }
        let mut records = self.records.lock();
        if records.len() < self.capacity {
            records.push(record);
        } else {
            let fastest = records
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.duration)
                .map(|(i, r)| (i, r.duration));
            match fastest {
                Some((i, d)) if d < record.duration => records[i] = record,
                _ => return,
            }
        }
        metrics().record_slow_statement();
    }

    /// Snapshot, slowest first
    pub fn records(&self) -> Vec<SqlRecord> {
        let mut out = self.records.lock().clone();
        out.sort_by(|a, b| b.duration.cmp(&a.duration));
        out
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
