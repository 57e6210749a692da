//! Write coalescing in front of a stream's dedicated log.
//!
//! Sequential appends accumulate in an active [`BufferedBlock`] until it is
//! full, an explicit flush is requested, it crosses the configured threshold,
//! or the idle timer fires. The block is then handed to a background task
//! that writes it as a single physical record and stays visible to readers
//! in the flushing list until that write completes.

pub mod buffer;
pub mod progress;

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::allocator::BufferLease;
use crate::config::{Asn, CoalesceConfig, RetryPolicy, StreamId, Version};
use crate::error::{OverlayError, OverlayResult};
use crate::flush::{FlushSignal, RetryBudget, retry_physical};
use crate::metrics::StreamMetrics;
use crate::physical::{LogStreamHandle, ReadType};
use crate::record::{RecordCodec, RecordFlags};

pub use buffer::{BlockState, BufferSnapshot, BufferedBlock, BufferedRecord};
pub use progress::{FlushProgress, ProgressState};

/// A caller write handed to the engine.
#[derive(Debug)]
pub struct CoalesceWrite {
    pub asn: Asn,
    pub version: Version,
    pub barrier: bool,
    pub metadata: Bytes,
    pub data: Bytes,
    /// Bypass coalescing and write this record on its own.
    pub independent: bool,
    /// Buffer memory held until the record is durable.
    pub lease: Option<BufferLease>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Full,
    Threshold,
    Explicit,
    Idle,
    Independent,
    TruncateTail,
    Close,
}

impl FlushReason {
    fn as_str(self) -> &'static str {
        match self {
            FlushReason::Full => "full",
            FlushReason::Threshold => "threshold",
            FlushReason::Explicit => "explicit",
            FlushReason::Idle => "idle",
            FlushReason::Independent => "independent",
            FlushReason::TruncateTail => "truncate-tail",
            FlushReason::Close => "close",
        }
    }
}

struct ActiveBlock {
    block: BufferedBlock,
    /// Parallel to the block's records.
    leases: Vec<Option<BufferLease>>,
    signal: Arc<FlushSignal>,
}

struct InFlight {
    block: BufferedBlock,
    signal: Arc<FlushSignal>,
    leases: Mutex<Vec<Option<BufferLease>>>,
}

struct EngineState {
    active: Option<ActiveBlock>,
    flushing: Vec<Arc<InFlight>>,
    enabled: bool,
    closing: bool,
}

struct EngineInner {
    stream_id: StreamId,
    dedicated: LogStreamHandle,
    codec: RecordCodec,
    config: CoalesceConfig,
    retry: RetryPolicy,
    progress: Arc<FlushProgress>,
    metrics: Arc<StreamMetrics>,
    state: Mutex<EngineState>,
    timer: CancellationToken,
    abort: CancellationToken,
}

/// Per-stream write buffering and flush state machine.
#[derive(Clone)]
pub struct CoalesceEngine {
    inner: Arc<EngineInner>,
}

impl CoalesceEngine {
    /// Must be called from within a tokio runtime when the idle timer is
    /// enabled.
    pub fn new(
        stream_id: StreamId,
        dedicated: LogStreamHandle,
        codec: RecordCodec,
        config: CoalesceConfig,
        retry: RetryPolicy,
        progress: Arc<FlushProgress>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            stream_id,
            dedicated,
            codec,
            config,
            retry,
            progress,
            metrics,
            state: Mutex::new(EngineState {
                active: None,
                flushing: Vec::new(),
                enabled: config.enabled,
                closing: false,
            }),
            timer: CancellationToken::new(),
            abort: CancellationToken::new(),
        });
        if let Some(interval) = config.flush_interval() {
            spawn_idle_timer(Arc::downgrade(&inner), inner.timer.clone(), interval);
        }
        Self { inner }
    }

    pub fn stream_id(&self) -> StreamId {
        self.inner.stream_id
    }

    pub fn progress(&self) -> &Arc<FlushProgress> {
        &self.inner.progress
    }

    pub fn is_coalescing_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// Flush the active block and write every later record on its own.
    pub fn disable_coalescing_writes(&self) {
        let mut state = self.inner.state.lock();
        state.enabled = false;
        self.inner.start_flush_locked(&mut state, FlushReason::Explicit);
    }

    pub fn enable_coalescing_writes(&self) {
        self.inner.state.lock().enabled = true;
    }

    /// Reader view of the active and flushing blocks.
    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.inner.state.lock();
        let mut blocks: Vec<BufferedBlock> =
            state.flushing.iter().map(|flight| flight.block.clone()).collect();
        if let Some(active) = &state.active {
            blocks.push(active.block.clone());
        }
        BufferSnapshot::new(blocks)
    }

    /// Bytes held in the active block.
    pub fn buffered_bytes(&self) -> u64 {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map_or(0, |active| active.block.bytes())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().flushing.len()
    }

    /// Accept a write. The returned signal completes once the record's
    /// dedicated copy is durable (or failed).
    ///
    /// A write below the current tail first discards everything at or after
    /// its ASN, in memory and on the dedicated log.
    pub async fn write(&self, write: CoalesceWrite) -> OverlayResult<Arc<FlushSignal>> {
        if write.data.is_empty() {
            return Err(OverlayError::invalid_parameter("empty writes are not allowed"));
        }
        if write.metadata.len() > self.inner.codec.max_metadata_bytes() {
            return Err(OverlayError::invalid_parameter(format!(
                "metadata of {} bytes exceeds block capacity {}",
                write.metadata.len(),
                self.inner.codec.max_metadata_bytes()
            )));
        }
        if self.inner.state.lock().closing {
            return Err(OverlayError::Closing);
        }
        if self
            .inner
            .progress
            .tail()
            .is_some_and(|tail| write.asn < tail)
        {
            self.truncate_tail(write.asn, write.version).await?;
        }
        self.inner.accept(write)
    }

    /// Discard all content at or after `point`, replacing it with nothing.
    ///
    /// On return no buffered block and no dedicated record holds bytes at or
    /// after `point`; whatever precedes it is durable.
    pub async fn truncate_tail(&self, point: Asn, version: Version) -> OverlayResult<()> {
        self.inner.metrics.incr_truncate_tail();
        debug!(
            stream = self.inner.stream_id.get(),
            asn = point.get(),
            version = version.get(),
            "truncating stream tail"
        );
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(OverlayError::Closing);
            }
            if let Some(active) = state.active.as_mut() {
                let kept = active.block.truncate_at(point);
                active.leases.truncate(kept);
            }
            self.inner
                .start_flush_locked(&mut state, FlushReason::TruncateTail);
        }
        self.inner.drain_flushing().await?;
        discard_dedicated_tail(
            &self.inner.dedicated,
            &self.inner.codec,
            &self.inner.retry,
            &self.inner.abort,
            point,
            version,
        )
        .await?;
        self.inner.progress.reset_tail(point);
        Ok(())
    }

    /// Start flushing the active block, if any. The returned signal
    /// completes when it is durable.
    pub fn flush(&self) -> Option<Arc<FlushSignal>> {
        let mut state = self.inner.state.lock();
        self.inner.start_flush_locked(&mut state, FlushReason::Explicit)
    }

    /// Flush the active block and wait for every in-flight flush.
    pub async fn flush_and_wait(&self) -> OverlayResult<()> {
        self.flush();
        self.inner.drain_flushing().await
    }

    /// Drain the active block and every flushing block, then refuse further
    /// writes. The idle timer is stopped first, so a tick that races with
    /// close sees the closing state and does nothing.
    pub async fn flush_all_records_for_close(&self) -> OverlayResult<()> {
        {
            let mut state = self.inner.state.lock();
            state.closing = true;
            self.inner.timer.cancel();
            self.inner.start_flush_locked(&mut state, FlushReason::Close);
        }
        let result = self.inner.drain_flushing().await;
        debug!(
            stream = self.inner.stream_id.get(),
            ok = result.is_ok(),
            "coalescing engine drained for close"
        );
        result
    }

    /// Abandon retries of any flush still running. Used after the drain.
    pub fn shutdown(&self) {
        self.inner.timer.cancel();
        self.inner.abort.cancel();
    }
}

impl EngineInner {
    fn accept(self: &Arc<Self>, write: CoalesceWrite) -> OverlayResult<Arc<FlushSignal>> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(OverlayError::Closing);
        }
        let CoalesceWrite {
            asn,
            version,
            barrier,
            metadata,
            data,
            independent,
            lease,
        } = write;
        let len = data.len() as u64;
        let record = BufferedRecord {
            asn,
            version,
            barrier,
            metadata,
            data,
        };
        self.progress.accept(asn, record.end());

        if independent || !state.enabled || len >= self.config.max_record_bytes {
            self.start_flush_locked(&mut state, FlushReason::Independent);
            let signal = Arc::new(FlushSignal::new());
            self.metrics.incr_independent_write();
            self.launch(
                &mut state,
                BufferedBlock::new(record).into_flushing(),
                Arc::clone(&signal),
                vec![lease],
                FlushReason::Independent,
            );
            return Ok(signal);
        }

        let appendable = state.active.as_ref().is_some_and(|active| {
            active.block.end() == asn && active.block.bytes() + len <= self.config.max_record_bytes
        });
        if !appendable {
            self.start_flush_locked(&mut state, FlushReason::Full);
        }
        let (signal, bytes) = match state.active.as_mut() {
            Some(active) => {
                active.block.push(record);
                active.leases.push(lease);
                (Arc::clone(&active.signal), active.block.bytes())
            }
            None => {
                let signal = Arc::new(FlushSignal::new());
                let block = BufferedBlock::new(record);
                let bytes = block.bytes();
                state.active = Some(ActiveBlock {
                    block,
                    leases: vec![lease],
                    signal: Arc::clone(&signal),
                });
                (signal, bytes)
            }
        };
        trace!(
            stream = self.stream_id.get(),
            asn = asn.get(),
            version = version.get(),
            buffered = bytes,
            "write buffered"
        );
        if bytes >= self.config.flush_threshold_bytes() {
            self.start_flush_locked(&mut state, FlushReason::Threshold);
        }
        Ok(signal)
    }

    fn start_flush_locked(
        self: &Arc<Self>,
        state: &mut EngineState,
        reason: FlushReason,
    ) -> Option<Arc<FlushSignal>> {
        let active = state.active.take()?;
        if active.block.is_empty() {
            // Everything it held was discarded by a truncate-tail.
            active.signal.complete(Ok(()));
            return None;
        }
        self.metrics.incr_coalesced_flush();
        let signal = Arc::clone(&active.signal);
        self.launch(
            state,
            active.block.into_flushing(),
            active.signal,
            active.leases,
            reason,
        );
        Some(signal)
    }

    fn launch(
        self: &Arc<Self>,
        state: &mut EngineState,
        block: BufferedBlock,
        signal: Arc<FlushSignal>,
        leases: Vec<Option<BufferLease>>,
        reason: FlushReason,
    ) {
        debug!(
            stream = self.stream_id.get(),
            asn = block.start().get(),
            version = block.version().get(),
            bytes = block.bytes(),
            records = block.records().len(),
            reason = reason.as_str(),
            "flushing dedicated record"
        );
        let flight = Arc::new(InFlight {
            block,
            signal,
            leases: Mutex::new(leases),
        });
        state.flushing.push(Arc::clone(&flight));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.write_block(&flight.block).await;
            inner.finish_flush(&flight, result);
        });
    }

    async fn write_block(&self, block: &BufferedBlock) -> OverlayResult<()> {
        let encoded = self.codec.encode(
            self.stream_id,
            block.start(),
            block.version(),
            RecordFlags::barrier(block.barrier()),
            &block.metadata(),
            &block.segments(),
        )?;
        let (result, retries) = retry_physical(
            &self.retry,
            RetryBudget::Bounded,
            &self.abort,
            "dedicated flush",
            || {
                self.dedicated.write(
                    block.start(),
                    block.version(),
                    block.bytes(),
                    encoded.meta.clone(),
                    encoded.data.clone(),
                )
            },
        )
        .await;
        self.metrics.add_flush_retries(retries as u64);
        result
    }

    fn finish_flush(&self, flight: &Arc<InFlight>, result: OverlayResult<()>) {
        let asns = flight.block.records().iter().map(|record| record.asn);
        let outcome = match result {
            Ok(()) => {
                self.progress.persisted(asns);
                trace!(
                    stream = self.stream_id.get(),
                    asn = flight.block.start().get(),
                    end = flight.block.end().get(),
                    "dedicated record durable"
                );
                Ok(())
            }
            Err(OverlayError::Closing) => {
                warn!(
                    stream = self.stream_id.get(),
                    asn = flight.block.start().get(),
                    "flush abandoned by shutdown"
                );
                Err(OverlayError::Closing)
            }
            Err(err) => {
                self.metrics.incr_flush_failure();
                self.progress.failed(asns);
                error!(
                    stream = self.stream_id.get(),
                    asn = flight.block.start().get(),
                    version = flight.block.version().get(),
                    error = %err,
                    "dedicated write failed permanently"
                );
                Err(OverlayError::PermanentWriteFailure {
                    stream: self.stream_id,
                    asn: flight.block.start(),
                })
            }
        };
        self.state
            .lock()
            .flushing
            .retain(|candidate| !Arc::ptr_eq(candidate, flight));
        flight.leases.lock().clear();
        flight.signal.complete(outcome);
    }

    /// Wait for every block in flight right now.
    async fn drain_flushing(&self) -> OverlayResult<()> {
        let signals: Vec<Arc<FlushSignal>> = self
            .state
            .lock()
            .flushing
            .iter()
            .map(|flight| Arc::clone(&flight.signal))
            .collect();
        let mut first_error = None;
        for signal in signals {
            if let Err(err) = signal.wait(&self.abort).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn flush_on_tick(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closing {
            trace!(stream = self.stream_id.get(), "idle flush skipped while closing");
            return;
        }
        self.start_flush_locked(&mut state, FlushReason::Idle);
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

fn spawn_idle_timer(engine: Weak<EngineInner>, token: CancellationToken, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = token.cancelled() => break,
            }
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.flush_on_tick();
        }
    });
}

/// Remove dedicated content at or after `point` that is older than
/// `version`. A record straddling `point` is rewritten with only its head,
/// stamped with `version`.
pub(crate) async fn discard_dedicated_tail(
    dedicated: &LogStreamHandle,
    codec: &RecordCodec,
    retry: &RetryPolicy,
    shutdown: &CancellationToken,
    point: Asn,
    version: Version,
) -> OverlayResult<()> {
    dedicated.truncate_below_version(point, version).await?;

    let straddler = match dedicated.read(point, ReadType::Containing).await {
        Ok(record) if record.asn < point && record.end() > point && record.version < version => {
            record
        }
        Ok(_) | Err(OverlayError::NotFound) => return Ok(()),
        Err(err) => return Err(err),
    };
    let stream_id = dedicated.stream_id();
    let decoded = codec.decode(stream_id, &straddler.meta, &straddler.data)?;
    let keep = point.get() - straddler.asn.get();
    let head = decoded.data.slice(..keep as usize);
    let encoded = codec.encode(
        stream_id,
        straddler.asn,
        version,
        decoded.flags,
        &decoded.metadata,
        &[head],
    )?;
    let (result, _) = retry_physical(retry, RetryBudget::Bounded, shutdown, "rewrite straddler", || {
        dedicated.write(
            straddler.asn,
            version,
            keep,
            encoded.meta.clone(),
            encoded.data.clone(),
        )
    })
    .await;
    result?;
    match dedicated.delete_record(straddler.asn, straddler.version).await {
        Ok(()) | Err(OverlayError::NotFound) => {}
        Err(err) => return Err(err),
    }
    debug!(
        stream = stream_id.get(),
        asn = straddler.asn.get(),
        kept = keep,
        "dedicated record shortened at truncate point"
    );
    Ok(())
}
