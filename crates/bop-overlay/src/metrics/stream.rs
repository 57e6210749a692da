use std::sync::atomic::{AtomicU64, Ordering};

use crate::stream::WriteRoute;

/// Point-in-time snapshot of one stream's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamMetricsSnapshot {
    pub dual_writes: u64,
    pub shared_writes: u64,
    pub dedicated_only_writes: u64,
    pub coalesced_flushes: u64,
    pub independent_writes: u64,
    pub flush_retries: u64,
    pub flush_failures: u64,
    pub truncate_tail_events: u64,
    pub destaged_records: u64,
    pub shared_truncations: u64,
    pub reads_from_shared: u64,
    pub reads_from_dedicated: u64,
}

#[derive(Debug, Default)]
pub struct StreamMetrics {
    dual_writes: AtomicU64,
    shared_writes: AtomicU64,
    dedicated_only_writes: AtomicU64,
    coalesced_flushes: AtomicU64,
    independent_writes: AtomicU64,
    flush_retries: AtomicU64,
    flush_failures: AtomicU64,
    truncate_tail_events: AtomicU64,
    destaged_records: AtomicU64,
    shared_truncations: AtomicU64,
    reads_from_shared: AtomicU64,
    reads_from_dedicated: AtomicU64,
}

impl StreamMetrics {
    pub fn incr_route(&self, route: WriteRoute) {
        let counter = match route {
            WriteRoute::Dual => &self.dual_writes,
            WriteRoute::SharedThenDestage => &self.shared_writes,
            WriteRoute::DedicatedOnly => &self.dedicated_only_writes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_coalesced_flush(&self) {
        self.coalesced_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_independent_write(&self) {
        self.independent_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_flush_retries(&self, retries: u64) {
        if retries > 0 {
            self.flush_retries.fetch_add(retries, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn incr_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_truncate_tail(&self) {
        self.truncate_tail_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_destaged(&self, records: u64) {
        self.destaged_records.fetch_add(records, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_shared_truncation(&self) {
        self.shared_truncations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_read(&self, from_shared: bool) {
        if from_shared {
            self.reads_from_shared.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads_from_dedicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        StreamMetricsSnapshot {
            dual_writes: self.dual_writes.load(Ordering::Relaxed),
            shared_writes: self.shared_writes.load(Ordering::Relaxed),
            dedicated_only_writes: self.dedicated_only_writes.load(Ordering::Relaxed),
            coalesced_flushes: self.coalesced_flushes.load(Ordering::Relaxed),
            independent_writes: self.independent_writes.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            truncate_tail_events: self.truncate_tail_events.load(Ordering::Relaxed),
            destaged_records: self.destaged_records.load(Ordering::Relaxed),
            shared_truncations: self.shared_truncations.load(Ordering::Relaxed),
            reads_from_shared: self.reads_from_shared.load(Ordering::Relaxed),
            reads_from_dedicated: self.reads_from_dedicated.load(Ordering::Relaxed),
        }
    }
}
