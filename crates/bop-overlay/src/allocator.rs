use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace};

use crate::error::{OverlayError, OverlayResult, SuspendKind};
use crate::metrics::{AdmissionMetrics, AdmissionMetricsSnapshot};

struct AllocatorInner {
    limit: u64,
    semaphore: Arc<Semaphore>,
    in_use: AtomicU64,
    metrics: AdmissionMetrics,
}

/// Process-wide bound on memory held by pending write buffers.
///
/// Each permit of the underlying semaphore is one byte. A write that cannot
/// get its bytes is suspended until another write releases its
/// [`BufferLease`], the optional timeout expires, or the allocator closes.
#[derive(Clone)]
pub struct ThrottledBufferAllocator {
    inner: Arc<AllocatorInner>,
}

impl ThrottledBufferAllocator {
    pub fn new(limit: u64) -> OverlayResult<Self> {
        if limit == 0 {
            return Err(OverlayError::invalid_parameter(
                "allocator limit must be non-zero",
            ));
        }
        let permits = limit.min(Semaphore::MAX_PERMITS as u64);
        Ok(Self {
            inner: Arc::new(AllocatorInner {
                limit: permits,
                semaphore: Arc::new(Semaphore::new(permits as usize)),
                in_use: AtomicU64::new(0),
                metrics: AdmissionMetrics::default(),
            }),
        })
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit
    }

    pub fn in_use(&self) -> u64 {
        self.inner.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.inner.semaphore.available_permits() as u64
    }

    pub fn metrics(&self) -> AdmissionMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Reserve `bytes`, suspending until they are available.
    ///
    /// A timeout only abandons this wait; leases already granted are
    /// unaffected.
    pub async fn allocate(&self, bytes: u64, timeout: Option<Duration>) -> OverlayResult<BufferLease> {
        let permits = self.permits_for(bytes)?;
        if permits == 0 {
            return Ok(self.lease(None, 0));
        }
        match Arc::clone(&self.inner.semaphore).try_acquire_many_owned(permits) {
            Ok(permit) => return Ok(self.lease(Some(permit), bytes)),
            Err(TryAcquireError::Closed) => return Err(OverlayError::Closing),
            Err(TryAcquireError::NoPermits) => {}
        }

        self.inner.metrics.incr_suspended(SuspendKind::Allocation);
        debug!(
            bytes,
            in_use = self.in_use(),
            limit = self.inner.limit,
            "buffer allocation suspended"
        );
        let started = Instant::now();
        let acquire = Arc::clone(&self.inner.semaphore).acquire_many_owned(permits);
        let acquired = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, acquire).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    self.inner.metrics.incr_timeout();
                    return Err(OverlayError::Timeout(SuspendKind::Allocation));
                }
            },
            None => acquire.await,
        };
        self.inner.metrics.record_wait(started.elapsed());
        match acquired {
            Ok(permit) => Ok(self.lease(Some(permit), bytes)),
            Err(_) => Err(OverlayError::Closing),
        }
    }

    /// Reserve `bytes` only if they are available right now.
    pub fn try_allocate(&self, bytes: u64) -> OverlayResult<Option<BufferLease>> {
        let permits = self.permits_for(bytes)?;
        if permits == 0 {
            return Ok(Some(self.lease(None, 0)));
        }
        match Arc::clone(&self.inner.semaphore).try_acquire_many_owned(permits) {
            Ok(permit) => Ok(Some(self.lease(Some(permit), bytes))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(OverlayError::Closing),
        }
    }

    /// Fail every current and future waiter with `Closing`.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    fn permits_for(&self, bytes: u64) -> OverlayResult<u32> {
        if bytes > self.inner.limit || bytes > u32::MAX as u64 {
            return Err(OverlayError::invalid_parameter(format!(
                "buffer of {bytes} bytes can never fit allocator limit {}",
                self.inner.limit
            )));
        }
        Ok(bytes as u32)
    }

    fn lease(&self, permit: Option<OwnedSemaphorePermit>, bytes: u64) -> BufferLease {
        let in_use = self.inner.in_use.fetch_add(bytes, Ordering::AcqRel) + bytes;
        trace!(bytes, in_use, "buffer lease granted");
        BufferLease {
            inner: Arc::clone(&self.inner),
            _permit: permit,
            bytes,
        }
    }
}

/// Memory reserved for one pending write; released on drop.
pub struct BufferLease {
    inner: Arc<AllocatorInner>,
    _permit: Option<OwnedSemaphorePermit>,
    bytes: u64,
}

impl BufferLease {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease").field("bytes", &self.bytes).finish()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.inner.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocation_suspends_until_release() {
        let allocator = ThrottledBufferAllocator::new(100).expect("allocator");
        let first = allocator.allocate(80, None).await.expect("first");
        assert_eq!(allocator.in_use(), 80);

        let waiter = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate(40, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = waiter.await.expect("join").expect("second");
        assert_eq!(second.bytes(), 40);
        assert_eq!(allocator.in_use(), 40);
        assert_eq!(allocator.metrics().suspended_allocation, 1);
    }

    #[tokio::test]
    async fn allocation_times_out_without_leaking() {
        let allocator = ThrottledBufferAllocator::new(10).expect("allocator");
        let _held = allocator.allocate(10, None).await.expect("held");
        let result = allocator.allocate(5, Some(Duration::from_millis(5))).await;
        assert_eq!(result.err(), Some(OverlayError::Timeout(SuspendKind::Allocation)));
        assert_eq!(allocator.in_use(), 10);
        assert_eq!(allocator.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn close_unblocks_waiters() {
        let allocator = ThrottledBufferAllocator::new(10).expect("allocator");
        let _held = allocator.allocate(10, None).await.expect("held");
        let waiter = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate(1, None).await })
        };
        tokio::task::yield_now().await;
        allocator.close();
        let result = waiter.await.expect("join");
        assert_eq!(result.err(), Some(OverlayError::Closing));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let allocator = ThrottledBufferAllocator::new(10).expect("allocator");
        assert!(matches!(
            allocator.try_allocate(11),
            Err(OverlayError::InvalidParameter(_))
        ));
        let lease = allocator.try_allocate(0).expect("zero").expect("lease");
        assert_eq!(lease.bytes(), 0);
    }
}
