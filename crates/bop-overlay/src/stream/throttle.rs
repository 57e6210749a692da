use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coalesce::{CoalesceEngine, FlushProgress, ProgressState};
use crate::config::{StreamId, UNLIMITED_THROTTLE};
use crate::error::{OverlayError, OverlayResult, SuspendKind};
use crate::metrics::AdmissionMetrics;

/// Per-stream cap on bytes accepted but not yet durable on the dedicated log.
#[derive(Debug)]
pub struct WriteThrottle {
    threshold: AtomicU64,
}

impl WriteThrottle {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: AtomicU64::new(threshold),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Acquire)
    }

    pub fn is_limited(&self) -> bool {
        self.threshold() != UNLIMITED_THROTTLE
    }

    /// Replace the threshold, returning the previous one.
    ///
    /// A limited threshold below what is already outstanding is rejected:
    /// the writes holding those bytes were admitted under the old limit.
    pub fn set_threshold(&self, threshold: u64, outstanding: u64) -> OverlayResult<u64> {
        if threshold == 0 {
            return Err(OverlayError::invalid_parameter(
                "write throttle threshold must be non-zero",
            ));
        }
        if threshold != UNLIMITED_THROTTLE && threshold < outstanding {
            return Err(OverlayError::invalid_parameter(format!(
                "write throttle threshold {threshold} is below {outstanding} outstanding bytes"
            )));
        }
        Ok(self.threshold.swap(threshold, Ordering::AcqRel))
    }

    fn admits(&self, state: &ProgressState, bytes: u64) -> bool {
        let threshold = self.threshold();
        let outstanding = state.outstanding_bytes();
        // A write larger than the threshold goes through once nothing else is
        // outstanding.
        threshold == UNLIMITED_THROTTLE
            || outstanding == 0
            || outstanding.saturating_add(bytes) <= threshold
    }

    /// Whether `bytes` more fit under the threshold right now.
    pub fn admits_now(&self, progress: &FlushProgress, bytes: u64) -> bool {
        self.admits(&progress.snapshot(), bytes)
    }

    /// Suspend until `bytes` more fit under the threshold.
    pub async fn admit(
        &self,
        stream_id: StreamId,
        bytes: u64,
        engine: &CoalesceEngine,
        progress: &FlushProgress,
        shutdown: &CancellationToken,
        metrics: &AdmissionMetrics,
    ) -> OverlayResult<()> {
        if self.admits(&progress.snapshot(), bytes) {
            return Ok(());
        }
        metrics.incr_suspended(SuspendKind::Throttle);
        debug!(
            stream = stream_id.get(),
            bytes,
            outstanding = progress.outstanding_bytes(),
            threshold = self.threshold(),
            "write suspended by dedicated throttle"
        );
        // Buffered bytes only drain once they are flushed.
        engine.flush();
        let started = Instant::now();
        progress
            .wait_until(shutdown, |state| self.admits(state, bytes))
            .await?;
        metrics.record_wait(started.elapsed());
        Ok(())
    }
}
