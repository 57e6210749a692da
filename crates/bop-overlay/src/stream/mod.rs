//! One logical stream backed by a shared and a dedicated physical log.
//!
//! A [`StreamOverlay`] routes each write to the shared log, the dedicated
//! log (through its [`CoalesceEngine`]) or both, resolves reads across the
//! two logs and the in-memory buffers, and truncates the shared log behind
//! the point up to which the dedicated log is durable.

pub mod ledger;
pub mod read;
pub mod recovery;
pub mod throttle;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::allocator::ThrottledBufferAllocator;
use crate::coalesce::{CoalesceEngine, CoalesceWrite, FlushProgress};
use crate::config::{Asn, OverlayConfig, StreamId, Version};
use crate::error::{OverlayError, OverlayResult, SuspendKind};
use crate::flush::{RetryBudget, retry_physical};
use crate::metrics::{
    AdmissionMetrics, AdmissionMetricsSnapshot, StreamMetrics, StreamMetricsSnapshot,
};
use crate::physical::{LogStreamHandle, ReadType, RecordDisposition, RecordMetadata, RecordRange};
use crate::quota::SharedQuotas;
use crate::record::{RecordCodec, RecordFlags};

pub use ledger::SharedLedger;
pub use read::{ReadRecord, RecordSource};
pub use recovery::Recovered;
pub use throttle::WriteThrottle;

use read::{Candidate, Origin};

/// Where a write's copies went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteRoute {
    /// Shared and dedicated copies written together.
    Dual,
    /// Shared copy now, dedicated copy later through the coalescing engine.
    SharedThenDestage,
    /// The shared log was skipped.
    DedicatedOnly,
}

/// A caller append.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub asn: Asn,
    pub version: Version,
    pub metadata: Bytes,
    pub data: Bytes,
    /// The write ends a caller-visible logical record.
    pub barrier: bool,
    /// Write this record on its own, bypassing coalescing.
    pub force_flush: bool,
}

impl WriteRequest {
    pub fn new(asn: Asn, version: Version, data: impl Into<Bytes>) -> Self {
        Self {
            asn,
            version,
            metadata: Bytes::new(),
            data: data.into(),
            barrier: true,
            force_flush: false,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_barrier(mut self, barrier: bool) -> Self {
        self.barrier = barrier;
        self
    }

    pub fn with_force_flush(mut self, force_flush: bool) -> Self {
        self.force_flush = force_flush;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub route: WriteRoute,
    /// Whether a shared copy of the record was written.
    pub shared_written: bool,
}

/// Container resources handed to every stream at open.
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub(crate) config: Arc<OverlayConfig>,
    pub(crate) allocator: ThrottledBufferAllocator,
    pub(crate) quotas: SharedQuotas,
    /// Smaller of the configured limit and the shared container's own.
    pub(crate) shared_max_record_bytes: u64,
    pub(crate) shutdown: CancellationToken,
}

#[derive(Debug)]
struct WriterState {
    first_write: bool,
    last_version: Option<Version>,
}

const WAITING_NONE: u8 = 0;

fn suspend_code(kind: SuspendKind) -> u8 {
    match kind {
        SuspendKind::Allocation => 1,
        SuspendKind::Throttle => 2,
        SuspendKind::LogFull => 3,
        SuspendKind::Flush => 4,
    }
}

fn suspend_kind(code: u8) -> SuspendKind {
    match code {
        1 => SuspendKind::Allocation,
        2 => SuspendKind::Throttle,
        3 => SuspendKind::LogFull,
        _ => SuspendKind::Flush,
    }
}

pub struct StreamOverlay {
    stream_id: StreamId,
    shared: LogStreamHandle,
    dedicated: LogStreamHandle,
    codec: RecordCodec,
    config: Arc<OverlayConfig>,
    shared_max_record_bytes: u64,
    allocator: ThrottledBufferAllocator,
    quotas: SharedQuotas,
    engine: CoalesceEngine,
    progress: Arc<FlushProgress>,
    ledger: Arc<SharedLedger>,
    throttle: WriteThrottle,
    metrics: Arc<StreamMetrics>,
    admission: AdmissionMetrics,
    writer: Mutex<WriterState>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    /// Last suspension point a write entered, reported on caller timeouts.
    waiting_on: AtomicU8,
    recovered: Recovered,
}

impl std::fmt::Debug for StreamOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOverlay")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl StreamOverlay {
    /// Recover the stream from its two logs and start serving it.
    pub(crate) async fn open(
        stream_id: StreamId,
        shared: LogStreamHandle,
        dedicated: LogStreamHandle,
        ctx: StreamContext,
    ) -> OverlayResult<Arc<Self>> {
        let codec = RecordCodec::new(ctx.config.metadata_block_bytes);
        let metrics = Arc::new(StreamMetrics::default());
        let recovered = recovery::recover(recovery::RecoveryContext {
            stream_id,
            shared: &shared,
            dedicated: &dedicated,
            codec: &codec,
            retry: &ctx.config.retry,
            shutdown: &ctx.shutdown,
            metrics: &metrics,
        })
        .await?;

        let progress = Arc::new(FlushProgress::new(recovered.tail));
        let engine = CoalesceEngine::new(
            stream_id,
            dedicated.clone(),
            codec,
            ctx.config.coalesce,
            ctx.config.retry,
            Arc::clone(&progress),
            Arc::clone(&metrics),
        );
        let last_version = (recovered.high_version > Version::default())
            .then_some(recovered.high_version);
        let stream = Arc::new(Self {
            stream_id,
            shared,
            dedicated,
            codec,
            shared_max_record_bytes: ctx.shared_max_record_bytes,
            allocator: ctx.allocator,
            quotas: ctx.quotas,
            engine,
            progress,
            ledger: Arc::new(SharedLedger::new(recovered.shared_truncated_to)),
            throttle: WriteThrottle::new(ctx.config.default_write_throttle),
            metrics,
            admission: AdmissionMetrics::default(),
            writer: Mutex::new(WriterState {
                first_write: true,
                last_version,
            }),
            shutdown: ctx.shutdown,
            closed: AtomicBool::new(false),
            waiting_on: AtomicU8::new(WAITING_NONE),
            recovered,
            config: ctx.config,
        });
        spawn_reclaimer(Arc::downgrade(&stream));
        debug!(
            stream = stream_id.get(),
            tail = recovered.tail.map(Asn::get),
            version = recovered.high_version.get(),
            "stream opened"
        );
        Ok(stream)
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// End of the accepted content, `None` for a stream without data.
    pub fn tail(&self) -> Option<Asn> {
        self.progress.tail()
    }

    pub fn recovered(&self) -> Recovered {
        self.recovered
    }

    /// Bytes of accepted writes whose dedicated copy is not yet durable.
    pub fn outstanding_bytes(&self) -> u64 {
        self.progress.outstanding_bytes()
    }

    /// Bytes charged against this stream's shared-log quota.
    pub fn shared_used_bytes(&self) -> u64 {
        self.ledger.used()
    }

    pub fn shared_truncated_to(&self) -> Asn {
        self.ledger.truncated_to()
    }

    pub fn quota(&self) -> u64 {
        self.quotas.load().quota_for(self.stream_id).unwrap_or(0)
    }

    pub fn metrics(&self) -> StreamMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn admission_metrics(&self) -> AdmissionMetricsSnapshot {
        self.admission.snapshot()
    }

    pub fn write_throttle_threshold(&self) -> u64 {
        self.throttle.threshold()
    }

    /// Append a record. Returns once the record is durable on at least one
    /// log.
    pub async fn write(&self, request: WriteRequest) -> OverlayResult<WriteOutcome> {
        self.ensure_writable()?;
        if request.data.is_empty() {
            return Err(OverlayError::invalid_parameter("empty writes are not allowed"));
        }
        if request.metadata.len() > self.codec.max_metadata_bytes() {
            return Err(OverlayError::invalid_parameter(format!(
                "metadata of {} bytes exceeds block capacity {}",
                request.metadata.len(),
                self.codec.max_metadata_bytes()
            )));
        }
        let bytes = request.data.len() as u64;

        self.waiting_on
            .store(suspend_code(SuspendKind::Allocation), Ordering::Release);
        let lease = match self.allocator.try_allocate(bytes)? {
            Some(lease) => lease,
            None => {
                // Leases held by the active block only return once it flushes.
                self.engine.flush();
                self.allocator
                    .allocate(bytes, self.config.allocation_timeout())
                    .await?
            }
        };
        self.waiting_on
            .store(suspend_code(SuspendKind::Throttle), Ordering::Release);
        // The engine counts outstanding bytes under the writer lock, so the
        // threshold is re-checked there before the write is accepted.
        let mut writer = loop {
            self.throttle
                .admit(
                    self.stream_id,
                    bytes,
                    &self.engine,
                    &self.progress,
                    &self.shutdown,
                    &self.admission,
                )
                .await?;
            let writer = self.writer.lock().await;
            self.ensure_writable()?;
            if self.throttle.admits_now(&self.progress, bytes) {
                break writer;
            }
        };
        if let Some(last) = writer.last_version {
            if request.version <= last {
                return Err(OverlayError::invalid_parameter(format!(
                    "version {} does not follow {}",
                    request.version, last
                )));
            }
        }
        let tail = self.progress.tail();
        if let Some(tail) = tail {
            if request.asn > tail {
                return Err(OverlayError::invalid_parameter(format!(
                    "write at {} leaves a gap after tail {}",
                    request.asn, tail
                )));
            }
            if request.asn < tail {
                self.truncate_tail(request.asn, request.version).await?;
            }
        }

        let independent = writer.first_write
            || request.force_flush
            || bytes >= self.config.coalesce.max_record_bytes
            || !self.engine.is_coalescing_enabled();
        let encoded = self.codec.encode(
            self.stream_id,
            request.asn,
            request.version,
            RecordFlags::barrier(request.barrier),
            &request.metadata,
            std::slice::from_ref(&request.data),
        )?;
        let physical = encoded.physical_size();
        let mut route = match (self.shared_admits(request.asn, physical), independent) {
            (true, true) => WriteRoute::Dual,
            (true, false) => WriteRoute::SharedThenDestage,
            (false, _) => WriteRoute::DedicatedOnly,
        };

        let mut shared_written = false;
        if route != WriteRoute::DedicatedOnly {
            self.waiting_on
                .store(suspend_code(SuspendKind::LogFull), Ordering::Release);
            match self
                .write_shared(request.asn, request.version, bytes, encoded.meta, encoded.data)
                .await
            {
                Ok(()) => {
                    self.ledger.record_write(
                        request.asn,
                        request.asn.advance(bytes),
                        request.version,
                        physical,
                    );
                    shared_written = true;
                }
                Err(OverlayError::Closing) => return Err(OverlayError::Closing),
                Err(err) => {
                    warn!(
                        stream = self.stream_id.get(),
                        asn = request.asn.get(),
                        error = %err,
                        "shared write failed, continuing on dedicated log"
                    );
                    route = WriteRoute::DedicatedOnly;
                }
            }
        }

        let ticket = self
            .engine
            .write(CoalesceWrite {
                asn: request.asn,
                version: request.version,
                barrier: request.barrier,
                metadata: request.metadata,
                data: request.data,
                independent,
                lease: Some(lease),
            })
            .await?;
        writer.first_write = false;
        writer.last_version = Some(request.version);
        drop(writer);

        self.metrics.incr_route(route);
        trace!(
            stream = self.stream_id.get(),
            asn = request.asn.get(),
            version = request.version.get(),
            bytes,
            ?route,
            independent,
            "write routed"
        );
        if route != WriteRoute::SharedThenDestage {
            if self.config.coalesce.flush_interval().is_none() {
                self.engine.flush();
            }
            self.waiting_on
                .store(suspend_code(SuspendKind::Flush), Ordering::Release);
            if !ticket.is_ready() {
                self.admission.incr_suspended(SuspendKind::Flush);
            }
            ticket.wait(&self.shutdown).await?;
        }
        self.waiting_on.store(WAITING_NONE, Ordering::Release);
        Ok(WriteOutcome {
            route,
            shared_written,
        })
    }

    /// [`write`](Self::write) with a caller deadline. Expiry only abandons
    /// the wait; the write itself keeps running and may still land.
    pub async fn write_with_timeout(
        self: &Arc<Self>,
        request: WriteRequest,
        timeout: Duration,
    ) -> OverlayResult<WriteOutcome> {
        let stream = Arc::clone(self);
        let mut task = tokio::spawn(async move { stream.write(request).await });
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined.map_err(|err| {
                OverlayError::invalid_state(format!("write task failed: {err}"))
            })?,
            Err(_) => {
                self.admission.incr_timeout();
                let kind = suspend_kind(self.waiting_on.load(Ordering::Acquire));
                debug!(
                    stream = self.stream_id.get(),
                    waiting_on = %kind,
                    "write wait timed out"
                );
                Err(OverlayError::Timeout(kind))
            }
        }
    }

    pub async fn read(&self, asn: Asn, read_type: ReadType) -> OverlayResult<ReadRecord> {
        self.ensure_open()?;
        let snapshot = self.engine.snapshot();
        let buffered = read::buffer_candidate(&snapshot, asn, read_type);
        let dedicated = read::physical_candidate(
            &self.dedicated,
            &self.codec,
            Origin::Dedicated,
            asn,
            read_type,
        )
        .await?;
        let shared =
            read::physical_candidate(&self.shared, &self.codec, Origin::Shared, asn, read_type)
                .await?;
        let dedicated_side = read::choose(read_type, buffered, dedicated);
        let Some(winner) = read::choose(read_type, dedicated_side, shared) else {
            return Err(OverlayError::NotFound);
        };
        if self.still_present(&winner).await? {
            return Ok(self.served(winner));
        }

        // The winner lost a race with truncation; the other side gets one try.
        debug!(
            stream = self.stream_id.get(),
            asn = asn.get(),
            lost = winner.origin.label(),
            "read candidate vanished, retrying other log"
        );
        let retry = match winner.origin {
            Origin::Shared => {
                let buffered = read::buffer_candidate(&self.engine.snapshot(), asn, read_type);
                let dedicated = read::physical_candidate(
                    &self.dedicated,
                    &self.codec,
                    Origin::Dedicated,
                    asn,
                    read_type,
                )
                .await?;
                read::choose(read_type, buffered, dedicated)
            }
            Origin::Dedicated | Origin::Buffer(_) => {
                read::physical_candidate(&self.shared, &self.codec, Origin::Shared, asn, read_type)
                    .await?
            }
        };
        match retry {
            Some(candidate) if self.still_present(&candidate).await? => {
                Ok(self.served(candidate))
            }
            _ => Err(OverlayError::NotFound),
        }
    }

    async fn still_present(&self, candidate: &Candidate) -> OverlayResult<bool> {
        match candidate.origin {
            Origin::Buffer(_) => Ok(true),
            Origin::Dedicated => read::confirm(&self.dedicated, candidate).await,
            Origin::Shared => read::confirm(&self.shared, candidate).await,
        }
    }

    fn served(&self, candidate: Candidate) -> ReadRecord {
        self.metrics
            .incr_read(candidate.record.source == RecordSource::Shared);
        candidate.record
    }

    /// The longest contiguous run of bytes from `start`, at most `limit`
    /// bytes, assembled across buffers and both logs.
    pub async fn multi_record_read(&self, start: Asn, limit: usize) -> OverlayResult<Bytes> {
        read::assemble_contiguous(self.stream_id, start, limit, move |asn| async move {
            self.read(asn, ReadType::Exact)
                .await
                .map(|record| record.data)
        })
        .await
    }

    /// Records starting in `[low, high]` across both logs and the buffers.
    /// Pending records are left out; `debug_info` names where each came from.
    pub async fn query_records(&self, low: Asn, high: Asn) -> OverlayResult<Vec<RecordMetadata>> {
        self.ensure_open()?;
        let snapshot = self.engine.snapshot();
        let mut merged: std::collections::BTreeMap<Asn, (RecordMetadata, u8)> =
            std::collections::BTreeMap::new();
        // Lower rank wins version ties.
        let mut offer = |meta: RecordMetadata, rank: u8| {
            let replace = merged.get(&meta.asn).is_none_or(|(current, current_rank)| {
                meta.version > current.version
                    || (meta.version == current.version && rank < *current_rank)
            });
            if replace {
                merged.insert(meta.asn, (meta, rank));
            }
        };
        for block in snapshot.blocks() {
            if block.start() < low || block.start() > high {
                continue;
            }
            offer(
                RecordMetadata {
                    asn: block.start(),
                    version: block.version(),
                    size: block.bytes(),
                    disposition: RecordDisposition::Pending,
                    debug_info: Origin::Buffer(block.state()).label().to_string(),
                },
                0,
            );
        }
        for (log, origin, rank) in [
            (&self.dedicated, Origin::Dedicated, 1u8),
            (&self.shared, Origin::Shared, 2u8),
        ] {
            for meta in log.query_records(low, high).await? {
                if meta.disposition != RecordDisposition::Persisted {
                    continue;
                }
                let debug_info = format!("{}:{}", origin.label(), meta.debug_info);
                offer(RecordMetadata { debug_info, ..meta }, rank);
            }
        }
        Ok(merged.into_values().map(|(meta, _)| meta).collect())
    }

    /// `(low, high, truncation)` over everything the stream holds.
    pub async fn query_record_range(&self) -> OverlayResult<RecordRange> {
        let truncation = self.dedicated.query_record_range().await?.truncation;
        let records = self.query_records(Asn::default(), Asn::MAX).await?;
        let low = records.first().map_or(truncation, |meta| meta.asn);
        let high = records.last().map_or(truncation, |meta| meta.asn);
        Ok(RecordRange {
            low,
            high,
            truncation,
        })
    }

    /// Release content below `point` on both logs. The shared log never
    /// moves past what the dedicated log holds durably.
    pub async fn truncate(&self, point: Asn) -> OverlayResult<()> {
        self.ensure_open()?;
        if self.progress.tail().is_none_or(|tail| point > tail) {
            return Err(OverlayError::invalid_parameter(format!(
                "truncation point {point} is beyond the stream tail"
            )));
        }
        self.dedicated.truncate(point, point).await?;
        self.reclaim_shared().await?;
        debug!(
            stream = self.stream_id.get(),
            point = point.get(),
            shared_truncated_to = self.ledger.truncated_to().get(),
            "stream truncated"
        );
        Ok(())
    }

    /// Force the buffered writes out to the dedicated log and wait for them.
    pub async fn flush(&self) -> OverlayResult<()> {
        self.ensure_open()?;
        self.engine.flush_and_wait().await
    }

    pub fn disable_coalescing_writes(&self) {
        debug!(stream = self.stream_id.get(), "coalescing disabled");
        self.engine.disable_coalescing_writes();
    }

    pub fn enable_coalescing_writes(&self) {
        debug!(stream = self.stream_id.get(), "coalescing enabled");
        self.engine.enable_coalescing_writes();
    }

    pub fn is_coalescing_enabled(&self) -> bool {
        self.engine.is_coalescing_enabled()
    }

    /// Replace the dedicated write throttle, returning the previous value.
    pub fn set_write_throttle_threshold(&self, threshold: u64) -> OverlayResult<u64> {
        let previous = self
            .throttle
            .set_threshold(threshold, self.progress.outstanding_bytes())?;
        debug!(
            stream = self.stream_id.get(),
            previous,
            threshold,
            "write throttle threshold changed"
        );
        self.progress.poke();
        Ok(previous)
    }

    /// Drain every buffered and in-flight write, then stop the stream.
    pub async fn close(&self) -> OverlayResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let drained = self.engine.flush_all_records_for_close().await;
        if drained.is_ok() {
            if let Err(err) = self.reclaim_shared().await {
                warn!(
                    stream = self.stream_id.get(),
                    error = %err,
                    "final shared truncation failed"
                );
            }
        }
        self.engine.shutdown();
        self.shutdown.cancel();
        debug!(
            stream = self.stream_id.get(),
            ok = drained.is_ok(),
            "stream closed"
        );
        drained
    }

    fn ensure_open(&self) -> OverlayResult<()> {
        if self.is_closed() || self.shutdown.is_cancelled() {
            return Err(OverlayError::Closing);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> OverlayResult<()> {
        self.ensure_open()?;
        if let Some(asn) = self.progress.failed_at() {
            return Err(OverlayError::PermanentWriteFailure {
                stream: self.stream_id,
                asn,
            });
        }
        Ok(())
    }

    fn shared_admits(&self, asn: Asn, physical: u64) -> bool {
        if physical > self.shared_max_record_bytes || asn < self.ledger.truncated_to() {
            return false;
        }
        self.ledger.used().saturating_add(physical) <= self.quota()
    }

    /// Shared write, retried through transient log-full conditions until it
    /// lands, fails permanently or the stream closes.
    async fn write_shared(
        &self,
        asn: Asn,
        version: Version,
        size: u64,
        meta: Bytes,
        data: Bytes,
    ) -> OverlayResult<()> {
        let mut attempts = 0u32;
        let (result, retries) = retry_physical(
            &self.config.retry,
            RetryBudget::UntilCancelled,
            &self.shutdown,
            "shared write",
            || {
                attempts += 1;
                if attempts == 2 {
                    self.admission.incr_suspended(SuspendKind::LogFull);
                }
                if attempts > 1 {
                    // Destaging buffered records is what frees shared space.
                    self.engine.flush();
                }
                self.shared
                    .write(asn, version, size, meta.clone(), data.clone())
            },
        )
        .await;
        if retries > 0 {
            debug!(
                stream = self.stream_id.get(),
                asn = asn.get(),
                retries,
                ok = result.is_ok(),
                "shared write retried"
            );
        }
        result
    }

    /// Discard accepted content at or after `point` on every tier.
    async fn truncate_tail(&self, point: Asn, version: Version) -> OverlayResult<()> {
        self.engine.truncate_tail(point, version).await?;
        self.ledger
            .discard_from(self.stream_id, &self.shared, point)
            .await?;
        Ok(())
    }

    /// Truncate the shared log up to the destage safe point.
    async fn reclaim_shared(&self) -> OverlayResult<bool> {
        let Some(point) = self.progress.safe_point() else {
            return Ok(false);
        };
        self.ledger
            .reclaim(self.stream_id, &self.shared, point, &self.metrics)
            .await
    }
}

impl Drop for StreamOverlay {
    fn drop(&mut self) {
        self.engine.shutdown();
        self.shutdown.cancel();
    }
}

/// Background task truncating the shared log whenever the destage safe
/// point moves past its truncation point.
fn spawn_reclaimer(stream: Weak<StreamOverlay>) {
    let Some(strong) = stream.upgrade() else {
        return;
    };
    let progress = Arc::clone(&strong.progress);
    let ledger = Arc::clone(&strong.ledger);
    let shutdown = strong.shutdown.clone();
    let retry = strong.config.retry;
    drop(strong);
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            let waited = progress
                .wait_until(&shutdown, |state| {
                    state
                        .safe_point()
                        .is_some_and(|point| point > ledger.truncated_to())
                })
                .await;
            if waited.is_err() {
                break;
            }
            let Some(stream) = stream.upgrade() else {
                break;
            };
            match stream.reclaim_shared().await {
                Ok(_) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        stream = stream.stream_id.get(),
                        error = %err,
                        failures,
                        "shared truncation failed"
                    );
                    drop(stream);
                    tokio::select! {
                        _ = tokio::time::sleep(retry.backoff(failures)) => {},
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
    });
}
