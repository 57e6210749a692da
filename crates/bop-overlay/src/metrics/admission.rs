use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::SuspendKind;

/// Point-in-time snapshot of admission control metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionMetricsSnapshot {
    /// Total time spent suspended (nanoseconds)
    pub total_wait_ns: u64,
    /// Number of suspensions measured
    pub wait_samples: u64,
    pub suspended_allocation: u64,
    pub suspended_throttle: u64,
    pub suspended_log_full: u64,
    pub suspended_flush: u64,
    /// Waits abandoned because the caller's timeout expired
    pub timeouts: u64,
}

impl AdmissionMetricsSnapshot {
    pub fn average_wait_ns(&self) -> u64 {
        if self.wait_samples == 0 {
            return 0;
        }
        self.total_wait_ns / self.wait_samples
    }

    pub fn suspended(&self, kind: SuspendKind) -> u64 {
        match kind {
            SuspendKind::Allocation => self.suspended_allocation,
            SuspendKind::Throttle => self.suspended_throttle,
            SuspendKind::LogFull => self.suspended_log_full,
            SuspendKind::Flush => self.suspended_flush,
        }
    }
}

/// Suspension counters for writes held back by backpressure.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    total_wait_ns: AtomicU64,
    wait_samples: AtomicU64,
    suspended_allocation: AtomicU64,
    suspended_throttle: AtomicU64,
    suspended_log_full: AtomicU64,
    suspended_flush: AtomicU64,
    timeouts: AtomicU64,
}

impl AdmissionMetrics {
    pub fn record_wait(&self, waited: Duration) {
        let nanos = waited.as_nanos().min(u64::MAX as u128) as u64;
        self.total_wait_ns.fetch_add(nanos, Ordering::Relaxed);
        self.wait_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_suspended(&self, kind: SuspendKind) {
        let counter = match kind {
            SuspendKind::Allocation => &self.suspended_allocation,
            SuspendKind::Throttle => &self.suspended_throttle,
            SuspendKind::LogFull => &self.suspended_log_full,
            SuspendKind::Flush => &self.suspended_flush,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdmissionMetricsSnapshot {
        AdmissionMetricsSnapshot {
            total_wait_ns: self.total_wait_ns.load(Ordering::Relaxed),
            wait_samples: self.wait_samples.load(Ordering::Relaxed),
            suspended_allocation: self.suspended_allocation.load(Ordering::Relaxed),
            suspended_throttle: self.suspended_throttle.load(Ordering::Relaxed),
            suspended_log_full: self.suspended_log_full.load(Ordering::Relaxed),
            suspended_flush: self.suspended_flush.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_wait_handles_empty() {
        let metrics = AdmissionMetrics::default();
        assert_eq!(metrics.snapshot().average_wait_ns(), 0);
        metrics.record_wait(Duration::from_nanos(300));
        metrics.record_wait(Duration::from_nanos(100));
        metrics.incr_suspended(SuspendKind::Throttle);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.average_wait_ns(), 200);
        assert_eq!(snapshot.suspended(SuspendKind::Throttle), 1);
        assert_eq!(snapshot.suspended(SuspendKind::Allocation), 0);
    }
}
