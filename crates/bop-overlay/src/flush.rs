//! Retry and completion plumbing shared by the coalescing engine and the
//! stream overlay.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{OverlayError, OverlayResult};

const FLUSH_PENDING: u8 = 0;
const FLUSH_PERSISTED: u8 = 1;
const FLUSH_FAILED: u8 = 2;

/// Completion signal for one physical dedicated write.
///
/// Every logical write that landed in a coalesced block holds the block's
/// signal, so a single flush outcome fans out to all of them.
#[derive(Debug)]
pub struct FlushSignal {
    state: AtomicU8,
    result: Mutex<Option<OverlayResult<()>>>,
    notify: Notify,
}

impl Default for FlushSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushSignal {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(FLUSH_PENDING),
            result: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn complete(&self, result: OverlayResult<()>) {
        let state = if result.is_ok() {
            FLUSH_PERSISTED
        } else {
            FLUSH_FAILED
        };
        *self.result.lock() = Some(result);
        self.state.store(state, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) != FLUSH_PENDING
    }

    pub fn is_persisted(&self) -> bool {
        self.state.load(Ordering::Acquire) == FLUSH_PERSISTED
    }

    pub fn result(&self) -> Option<OverlayResult<()>> {
        self.result.lock().clone()
    }

    /// Wait for the outcome; stream shutdown resolves the wait with `Closing`.
    pub async fn wait(&self, shutdown: &CancellationToken) -> OverlayResult<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            tokio::select! {
                _ = &mut notified => {},
                _ = shutdown.cancelled() => return Err(OverlayError::Closing),
            }
        }
    }
}

/// How long a retry loop keeps going on transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// Give up after `RetryPolicy::max_attempts`.
    Bounded,
    /// Keep retrying until success, a permanent error or cancellation.
    UntilCancelled,
}

/// Run `op` until it succeeds, fails permanently, exhausts `budget`, or
/// `shutdown` fires. Returns the result plus the number of retries made.
pub async fn retry_physical<T, F, Fut>(
    policy: &RetryPolicy,
    budget: RetryBudget,
    shutdown: &CancellationToken,
    what: &'static str,
    mut op: F,
) -> (OverlayResult<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OverlayResult<T>>,
{
    let mut retries = 0u32;
    loop {
        if shutdown.is_cancelled() {
            return (Err(OverlayError::Closing), retries);
        }
        match op().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(retries, op = what, "physical operation succeeded after retries");
                }
                return (Ok(value), retries);
            }
            Err(err) if err.is_transient() => {
                let exhausted =
                    budget == RetryBudget::Bounded && retries + 1 >= policy.max_attempts;
                if exhausted {
                    warn!(retries, op = what, error = %err, "physical operation failed after retries");
                    return (Err(err), retries);
                }
                retries += 1;
                debug!(attempt = retries, op = what, error = %err, "retrying physical operation");
                tokio::select! {
                    _ = tokio::time::sleep(policy.backoff(retries)) => {},
                    _ = shutdown.cancelled() => return (Err(OverlayError::Closing), retries),
                }
            }
            Err(err) => return (Err(err), retries),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Cheap jitter in `[0, window]` milliseconds.
pub(crate) fn jitter_millis(window: u64) -> u64 {
    (now_millis() & 0x3f).min(window)
}
