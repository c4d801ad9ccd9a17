/// Transfer progress shared between concurrent frame workers.
///
/// Progress counts DISTINCT bytes delivered: a range delivered twice (a frame
/// retried after a partial first attempt) only counts once, so the reported
/// value never exceeds the total and reaches it exactly when every byte has
/// been delivered.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Progress sink: `(bytes_completed, total_size)`. Called from any worker,
/// one call at a time, with non-decreasing values.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Set of delivered byte ranges, kept merged.
#[derive(Debug, Default)]
pub struct Coverage {
    /// start -> end, disjoint and non-adjacent.
    ranges: BTreeMap<u64, u64>,
    covered: u64,
}

impl Coverage {
    /// Add `[start, end)`. Returns how many bytes were not covered before.
    pub fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }

        // Ranges touching [start, end): ends are sorted like starts, so walk
        // back from the last range starting at or before `end`.
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        let mut merged_start = start;
        let mut merged_end = end;
        let mut overlap = 0;
        for (s, e) in touching {
            self.ranges.remove(&s);
            overlap += e.min(end).saturating_sub(s.max(start));
            merged_start = merged_start.min(s);
            merged_end = merged_end.max(e);
        }
        self.ranges.insert(merged_start, merged_end);

        let added = (end - start) - overlap;
        self.covered += added;
        added
    }

    pub fn covered(&self) -> u64 {
        self.covered
    }

    /// Whether `[0, total)` is fully covered.
    pub fn covers(&self, total: u64) -> bool {
        total == 0 || self.ranges.get(&0).is_some_and(|&end| end >= total)
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

pub struct TransferProgress {
    total: u64,
    completed: AtomicU64,
    coverage: Mutex<Coverage>,
    sink: Arc<ProgressFn>,
}

impl TransferProgress {
    pub fn new(total: u64, sink: Arc<ProgressFn>) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
            coverage: Mutex::new(Coverage::default()),
            sink,
        }
    }

    /// Record `[offset, offset + len)` as delivered and report the new total
    /// if it grew. Returns the distinct bytes delivered so far.
    pub fn record(&self, offset: u64, len: u64) -> u64 {
        // The sink runs under the coverage lock so reports stay ordered.
        let mut coverage = self.coverage.lock();
        let added = coverage.insert(offset, offset + len);
        let done = self.completed.fetch_add(added, Ordering::AcqRel) + added;
        if added > 0 {
            (self.sink)(done, self.total);
        }
        done
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.completed() >= self.total
    }

    /// Progress as a fraction 0.0 - 1.0.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed() as f64 / self.total as f64).min(1.0)
    }
}
