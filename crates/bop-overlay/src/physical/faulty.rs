use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::{
    LogContainerHandle, LogStreamHandle, PhysicalLogContainer, PhysicalLogStream, PhysicalRecord,
    ReadType, RecordMetadata, RecordRange,
};
use crate::config::{Asn, StreamId, Version};
use crate::error::{OverlayError, OverlayResult};

/// Scripted failures applied by a [`FaultyLogStream`].
///
/// Counters are consumed one per affected call, so a plan can express
/// "fail the next two writes, then recover".
pub struct FaultPlan {
    transient_write_failures: AtomicU32,
    log_full_writes: AtomicU32,
    permanent_writes: AtomicBool,
    lost_queries: AtomicU32,
    gate: watch::Sender<bool>,
    write_attempts: AtomicU64,
    deletes: Mutex<Vec<(Asn, Version)>>,
    truncations: Mutex<Vec<Asn>>,
}

impl Default for FaultPlan {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            transient_write_failures: AtomicU32::new(0),
            log_full_writes: AtomicU32::new(0),
            permanent_writes: AtomicBool::new(false),
            lost_queries: AtomicU32::new(0),
            gate,
            write_attempts: AtomicU64::new(0),
            deletes: Mutex::new(Vec::new()),
            truncations: Mutex::new(Vec::new()),
        }
    }
}

impl FaultPlan {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` writes with a transient error.
    pub fn fail_writes_transiently(&self, count: u32) {
        self.transient_write_failures.store(count, Ordering::Release);
    }

    /// Fail the next `count` writes with `LogFull`.
    pub fn report_log_full(&self, count: u32) {
        self.log_full_writes.store(count, Ordering::Release);
    }

    /// Fail every write with a permanent error until cleared.
    pub fn fail_writes_permanently(&self, enabled: bool) {
        self.permanent_writes.store(enabled, Ordering::Release);
    }

    /// Report the next `count` record queries as gone, as if a truncation
    /// raced with the reader.
    pub fn lose_queries(&self, count: u32) {
        self.lost_queries.store(count, Ordering::Release);
    }

    /// Hold writes before they reach the inner log until [`release_writes`].
    ///
    /// [`release_writes`]: FaultPlan::release_writes
    pub fn stall_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Acquire)
    }

    pub fn deletes(&self) -> Vec<(Asn, Version)> {
        self.deletes.lock().clone()
    }

    pub fn truncations(&self) -> Vec<Asn> {
        self.truncations.lock().clone()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn scripted_write_failure(&self) -> Option<OverlayError> {
        if self.permanent_writes.load(Ordering::Acquire) {
            return Some(OverlayError::permanent("injected permanent write failure"));
        }
        if Self::take(&self.log_full_writes) {
            return Some(OverlayError::LogFull);
        }
        if Self::take(&self.transient_write_failures) {
            return Some(OverlayError::transient("injected transient write failure"));
        }
        None
    }
}

/// Wraps a physical stream and applies a [`FaultPlan`] to it.
pub struct FaultyLogStream {
    inner: LogStreamHandle,
    plan: Arc<FaultPlan>,
}

impl FaultyLogStream {
    pub fn new(inner: LogStreamHandle, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }

    pub fn wrap(inner: LogStreamHandle, plan: Arc<FaultPlan>) -> LogStreamHandle {
        Arc::new(Self::new(inner, plan))
    }
}

impl PhysicalLogStream for FaultyLogStream {
    fn stream_id(&self) -> StreamId {
        self.inner.stream_id()
    }

    fn write(
        &self,
        asn: Asn,
        version: Version,
        size: u64,
        meta: Bytes,
        data: Bytes,
    ) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            self.plan.write_attempts.fetch_add(1, Ordering::AcqRel);
            let mut gate = self.plan.gate.subscribe();
            if gate.wait_for(|open| *open).await.is_err() {
                return Err(OverlayError::Closing);
            }
            if let Some(err) = self.plan.scripted_write_failure() {
                debug!(
                    stream = self.inner.stream_id().get(),
                    asn = asn.get(),
                    error = %err,
                    "injecting write failure"
                );
                return Err(err);
            }
            self.inner.write(asn, version, size, meta, data).await
        })
    }

    fn read(&self, asn: Asn, read_type: ReadType) -> BoxFuture<'_, OverlayResult<PhysicalRecord>> {
        self.inner.read(asn, read_type)
    }

    fn query_record_range(&self) -> BoxFuture<'_, OverlayResult<RecordRange>> {
        self.inner.query_record_range()
    }

    fn query_records(&self, low: Asn, high: Asn) -> BoxFuture<'_, OverlayResult<Vec<RecordMetadata>>> {
        self.inner.query_records(low, high)
    }

    fn query_record(&self, asn: Asn) -> BoxFuture<'_, OverlayResult<RecordMetadata>> {
        Box::pin(async move {
            if FaultPlan::take(&self.plan.lost_queries) {
                return Err(OverlayError::NotFound);
            }
            self.inner.query_record(asn).await
        })
    }

    fn truncate(&self, point: Asn, preferred: Asn) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            self.plan.truncations.lock().push(point);
            self.inner.truncate(point, preferred).await
        })
    }

    fn truncate_below_version(
        &self,
        point: Asn,
        version: Version,
    ) -> BoxFuture<'_, OverlayResult<()>> {
        self.inner.truncate_below_version(point, version)
    }

    fn delete_record(&self, asn: Asn, version: Version) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            self.plan.deletes.lock().push((asn, version));
            self.inner.delete_record(asn, version).await
        })
    }
}

/// Wraps a container so every stream it creates or opens runs under the
/// same [`FaultPlan`].
pub struct FaultyLogContainer {
    inner: LogContainerHandle,
    plan: Arc<FaultPlan>,
}

impl FaultyLogContainer {
    pub fn new(inner: LogContainerHandle, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }

    pub fn wrap(inner: LogContainerHandle, plan: Arc<FaultPlan>) -> LogContainerHandle {
        Arc::new(Self::new(inner, plan))
    }
}

impl PhysicalLogContainer for FaultyLogContainer {
    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn max_record_bytes(&self) -> u64 {
        self.inner.max_record_bytes()
    }

    fn create_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<LogStreamHandle>> {
        Box::pin(async move {
            let stream = self.inner.create_stream(stream_id).await?;
            Ok(FaultyLogStream::wrap(stream, Arc::clone(&self.plan)))
        })
    }

    fn open_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<LogStreamHandle>> {
        Box::pin(async move {
            let stream = self.inner.open_stream(stream_id).await?;
            Ok(FaultyLogStream::wrap(stream, Arc::clone(&self.plan)))
        })
    }

    fn delete_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<()>> {
        self.inner.delete_stream(stream_id)
    }

    fn list_streams(&self) -> BoxFuture<'_, OverlayResult<Vec<StreamId>>> {
        self.inner.list_streams()
    }

    fn load_catalog(&self) -> BoxFuture<'_, OverlayResult<Bytes>> {
        self.inner.load_catalog()
    }

    fn store_catalog(&self, catalog: Bytes) -> BoxFuture<'_, OverlayResult<()>> {
        self.inner.store_catalog(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::{MemoryLogContainer, PhysicalLogContainer};
    use std::time::Duration;

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let container = MemoryLogContainer::unbounded();
        let inner = container.create_stream(StreamId::new(1)).await.expect("create");
        let plan = FaultPlan::new();
        plan.report_log_full(1);
        plan.fail_writes_transiently(1);
        let stream = FaultyLogStream::wrap(inner, plan.clone());

        let payload = || Bytes::from_static(b"abc");
        let first = stream.write(Asn::new(0), Version::new(1), 3, Bytes::new(), payload()).await;
        assert_eq!(first, Err(OverlayError::LogFull));
        let second = stream.write(Asn::new(0), Version::new(1), 3, Bytes::new(), payload()).await;
        assert!(matches!(second, Err(OverlayError::Physical { transient: true, .. })));
        stream
            .write(Asn::new(0), Version::new(1), 3, Bytes::new(), payload())
            .await
            .expect("third write succeeds");
        assert_eq!(plan.write_attempts(), 3);
    }

    #[tokio::test]
    async fn stalled_writes_wait_for_release() {
        let container = MemoryLogContainer::unbounded();
        let inner = container.create_stream(StreamId::new(1)).await.expect("create");
        let plan = FaultPlan::new();
        plan.stall_writes();
        let stream = FaultyLogStream::wrap(inner, plan.clone());

        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .write(Asn::new(0), Version::new(1), 1, Bytes::new(), Bytes::from_static(b"x"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        plan.release_writes();
        writer.await.expect("join").expect("write");
        assert_eq!(container.stream(StreamId::new(1)).expect("stream").record_count(), 1);
    }
}
