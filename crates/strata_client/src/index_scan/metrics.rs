//! Coordinator counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for one coordinator, readable at any time without
/// the coordinator lock.
#[derive(Debug, Default)]
pub struct ScanCoordinatorMetrics {
    readahead_scanners: AtomicU64,
    specs_enqueued: AtomicU64,
    max_queue_depth: AtomicU64,
    malformed_entries: AtomicU64,
    candidates_buffered: AtomicU64,
    staging_flushes: AtomicU64,
}

impl ScanCoordinatorMetrics {
    pub(crate) fn record_readahead(&self) {
        self.readahead_scanners.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self, depth: usize) {
        self.specs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(depth as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_candidate(&self) {
        self.candidates_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_staging_flush(&self) {
        self.staging_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Primary-table readahead scanners launched.
    pub fn readahead_scanners(&self) -> u64 {
        self.readahead_scanners.load(Ordering::Relaxed)
    }

    /// Verification specs pushed onto the readahead queue.
    pub fn specs_enqueued(&self) -> u64 {
        self.specs_enqueued.load(Ordering::Relaxed)
    }

    /// High-water mark of the readahead queue depth.
    pub fn max_queue_depth(&self) -> u64 {
        self.max_queue_depth.load(Ordering::Relaxed)
    }

    /// Index entries dropped as unparseable or referencing an unknown
    /// column family.
    pub fn malformed_entries(&self) -> u64 {
        self.malformed_entries.load(Ordering::Relaxed)
    }

    /// New candidate rows accepted into the in-memory buffer.
    pub fn candidates_buffered(&self) -> u64 {
        self.candidates_buffered.load(Ordering::Relaxed)
    }

    /// Buffered-to-staging flushes performed (0 or 1 per scan).
    pub fn staging_flushes(&self) -> u64 {
        self.staging_flushes.load(Ordering::Relaxed)
    }
}
