use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    LogStreamHandle, PhysicalLogContainer, PhysicalLogStream, PhysicalRecord, ReadType,
    RecordDisposition, RecordMetadata, RecordRange,
};
use crate::config::{Asn, StreamId, Version};
use crate::error::{OverlayError, OverlayResult};

#[derive(Debug, Clone)]
struct StoredRecord {
    version: Version,
    size: u64,
    disposition: RecordDisposition,
    meta: Bytes,
    data: Bytes,
}

impl StoredRecord {
    fn physical_bytes(&self) -> u64 {
        (self.meta.len() + self.data.len()) as u64
    }

    fn to_physical(&self, asn: Asn) -> PhysicalRecord {
        PhysicalRecord {
            asn,
            version: self.version,
            disposition: self.disposition,
            size: self.size,
            meta: self.meta.clone(),
            data: self.data.clone(),
        }
    }

    fn to_metadata(&self, asn: Asn) -> RecordMetadata {
        RecordMetadata {
            asn,
            version: self.version,
            size: self.size,
            disposition: self.disposition,
            debug_info: format!("mem:{}b", self.physical_bytes()),
        }
    }
}

#[derive(Debug, Default)]
struct StreamLog {
    records: BTreeMap<Asn, StoredRecord>,
    truncation: Asn,
}

impl StreamLog {
    fn locate(&self, asn: Asn, read_type: ReadType) -> Option<(Asn, &StoredRecord)> {
        match read_type {
            ReadType::Exact => self.records.get(&asn).map(|r| (asn, r)),
            ReadType::Next => self
                .records
                .range((Bound::Excluded(asn), Bound::Unbounded))
                .next()
                .map(|(a, r)| (*a, r)),
            ReadType::Previous => self.records.range(..asn).next_back().map(|(a, r)| (*a, r)),
            ReadType::Containing => self
                .records
                .range(..=asn)
                .next_back()
                .filter(|(start, r)| asn < start.advance(r.size) || **start == asn)
                .map(|(a, r)| (*a, r)),
        }
    }
}

struct ContainerState {
    streams: HashMap<StreamId, Arc<Mutex<StreamLog>>>,
    catalog: Bytes,
    corrupted: Option<String>,
    used_bytes: u64,
}

struct ContainerInner {
    capacity: u64,
    max_record_bytes: u64,
    commit_delay: Mutex<Option<Duration>>,
    state: Mutex<ContainerState>,
}

impl ContainerInner {
    fn release(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.used_bytes = state.used_bytes.saturating_sub(bytes);
    }
}

/// In-memory container honouring the physical log contract.
///
/// A single container can play the shared role (many stream views drawing on
/// one capacity) or the dedicated/backup role (one log per stream).
#[derive(Clone)]
pub struct MemoryLogContainer {
    inner: Arc<ContainerInner>,
}

impl MemoryLogContainer {
    pub fn new(capacity: u64, max_record_bytes: u64) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                capacity,
                max_record_bytes,
                commit_delay: Mutex::new(None),
                state: Mutex::new(ContainerState {
                    streams: HashMap::new(),
                    catalog: Bytes::new(),
                    corrupted: None,
                    used_bytes: 0,
                }),
            }),
        }
    }

    /// A container without capacity or record-size limits.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }

    /// Keep each write pending for `delay` before it commits.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self.inner.commit_delay.lock() = delay;
    }

    /// Make subsequent catalog loads fail as if the container were damaged.
    pub fn set_corrupted(&self, reason: Option<String>) {
        self.inner.state.lock().corrupted = reason;
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.state.lock().used_bytes
    }

    pub fn contains_stream(&self, stream_id: StreamId) -> bool {
        self.inner.state.lock().streams.contains_key(&stream_id)
    }

    /// Typed handle to an existing stream, for tests that need the concrete type.
    pub fn stream(&self, stream_id: StreamId) -> Option<MemoryLogStream> {
        let log = self.inner.state.lock().streams.get(&stream_id).cloned()?;
        Some(MemoryLogStream {
            stream_id,
            container: Arc::clone(&self.inner),
            log,
        })
    }

    fn open_or_create(&self, stream_id: StreamId, create: bool) -> OverlayResult<MemoryLogStream> {
        let mut state = self.inner.state.lock();
        let log = match (state.streams.get(&stream_id), create) {
            (Some(_), true) => {
                return Err(OverlayError::AlreadyExists(format!("stream {stream_id}")));
            }
            (Some(log), false) => Arc::clone(log),
            (None, true) => {
                let log = Arc::new(Mutex::new(StreamLog::default()));
                state.streams.insert(stream_id, Arc::clone(&log));
                log
            }
            (None, false) => return Err(OverlayError::NotFound),
        };
        Ok(MemoryLogStream {
            stream_id,
            container: Arc::clone(&self.inner),
            log,
        })
    }
}

impl PhysicalLogContainer for MemoryLogContainer {
    fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    fn max_record_bytes(&self) -> u64 {
        self.inner.max_record_bytes
    }

    fn create_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<LogStreamHandle>> {
        Box::pin(async move {
            let stream = self.open_or_create(stream_id, true)?;
            Ok(Arc::new(stream) as LogStreamHandle)
        })
    }

    fn open_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<LogStreamHandle>> {
        Box::pin(async move {
            let stream = self.open_or_create(stream_id, false)?;
            Ok(Arc::new(stream) as LogStreamHandle)
        })
    }

    fn delete_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            let log = self
                .inner
                .state
                .lock()
                .streams
                .remove(&stream_id)
                .ok_or(OverlayError::NotFound)?;
            let freed: u64 = log
                .lock()
                .records
                .values()
                .map(StoredRecord::physical_bytes)
                .sum();
            self.inner.release(freed);
            Ok(())
        })
    }

    fn list_streams(&self) -> BoxFuture<'_, OverlayResult<Vec<StreamId>>> {
        Box::pin(async move {
            let mut ids: Vec<StreamId> = self.inner.state.lock().streams.keys().copied().collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn load_catalog(&self) -> BoxFuture<'_, OverlayResult<Bytes>> {
        Box::pin(async move {
            let state = self.inner.state.lock();
            if let Some(reason) = &state.corrupted {
                return Err(OverlayError::ContainerCorrupted(reason.clone()));
            }
            Ok(state.catalog.clone())
        })
    }

    fn store_catalog(&self, catalog: Bytes) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            self.inner.state.lock().catalog = catalog;
            Ok(())
        })
    }
}

/// One stream's view of a [`MemoryLogContainer`].
#[derive(Clone)]
pub struct MemoryLogStream {
    stream_id: StreamId,
    container: Arc<ContainerInner>,
    log: Arc<Mutex<StreamLog>>,
}

impl MemoryLogStream {
    /// Number of records currently held, pending ones included.
    pub fn record_count(&self) -> usize {
        self.log.lock().records.len()
    }

    /// Flip a record back to pending, as if its write never committed.
    pub fn mark_pending(&self, asn: Asn) -> bool {
        match self.log.lock().records.get_mut(&asn) {
            Some(record) => {
                record.disposition = RecordDisposition::Pending;
                true
            }
            None => false,
        }
    }

    fn insert_pending(&self, asn: Asn, record: StoredRecord) -> OverlayResult<()> {
        let bytes = record.physical_bytes();
        if bytes > self.container.max_record_bytes {
            return Err(OverlayError::invalid_parameter(format!(
                "record of {bytes} bytes exceeds container maximum {}",
                self.container.max_record_bytes
            )));
        }
        let mut log = self.log.lock();
        let replaced = log
            .records
            .get(&asn)
            .map(StoredRecord::physical_bytes)
            .unwrap_or(0);
        {
            let mut state = self.container.state.lock();
            let used = state.used_bytes.saturating_sub(replaced);
            if used.saturating_add(bytes) > self.container.capacity {
                return Err(OverlayError::LogFull);
            }
            state.used_bytes = used + bytes;
        }
        log.records.insert(asn, record);
        Ok(())
    }

    fn commit(&self, asn: Asn, version: Version) {
        if let Some(record) = self.log.lock().records.get_mut(&asn) {
            if record.version == version {
                record.disposition = RecordDisposition::Persisted;
            }
        }
    }

    fn remove_where<F>(&self, mut predicate: F) -> u64
    where
        F: FnMut(Asn, &StoredRecord) -> bool,
    {
        let mut log = self.log.lock();
        let doomed: Vec<Asn> = log
            .records
            .iter()
            .filter(|(asn, record)| predicate(**asn, record))
            .map(|(asn, _)| *asn)
            .collect();
        let mut freed = 0;
        for asn in doomed {
            if let Some(record) = log.records.remove(&asn) {
                freed += record.physical_bytes();
            }
        }
        drop(log);
        self.container.release(freed);
        freed
    }
}

impl PhysicalLogStream for MemoryLogStream {
    fn stream_id(&self) -> StreamId {
        self.stream_id
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
            self.insert_pending(
                asn,
                StoredRecord {
                    version,
                    size,
                    disposition: RecordDisposition::Pending,
                    meta,
                    data,
                },
            )?;
            let delay = *self.container.commit_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.commit(asn, version);
            trace!(
                stream = self.stream_id.get(),
                asn = asn.get(),
                version = version.get(),
                size,
                "memory log write committed"
            );
            Ok(())
        })
    }

    fn read(&self, asn: Asn, read_type: ReadType) -> BoxFuture<'_, OverlayResult<PhysicalRecord>> {
        Box::pin(async move {
            let log = self.log.lock();
            log.locate(asn, read_type)
                .map(|(asn, record)| record.to_physical(asn))
                .ok_or(OverlayError::NotFound)
        })
    }

    fn query_record_range(&self) -> BoxFuture<'_, OverlayResult<RecordRange>> {
        Box::pin(async move {
            let log = self.log.lock();
            let low = log.records.keys().next().copied();
            let high = log.records.keys().next_back().copied();
            Ok(RecordRange {
                low: low.unwrap_or(log.truncation),
                high: high.unwrap_or(log.truncation),
                truncation: log.truncation,
            })
        })
    }

    fn query_records(&self, low: Asn, high: Asn) -> BoxFuture<'_, OverlayResult<Vec<RecordMetadata>>> {
        Box::pin(async move {
            if low > high {
                return Ok(Vec::new());
            }
            let log = self.log.lock();
            Ok(log
                .records
                .range(low..=high)
                .map(|(asn, record)| record.to_metadata(*asn))
                .collect())
        })
    }

    fn query_record(&self, asn: Asn) -> BoxFuture<'_, OverlayResult<RecordMetadata>> {
        Box::pin(async move {
            let log = self.log.lock();
            log.records
                .get(&asn)
                .map(|record| record.to_metadata(asn))
                .ok_or(OverlayError::NotFound)
        })
    }

    fn truncate(&self, point: Asn, _preferred: Asn) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            let freed = self.remove_where(|asn, record| asn.advance(record.size) <= point);
            let mut log = self.log.lock();
            if point > log.truncation {
                log.truncation = point;
            }
            trace!(
                stream = self.stream_id.get(),
                point = point.get(),
                freed,
                "memory log truncated"
            );
            Ok(())
        })
    }

    fn truncate_below_version(
        &self,
        point: Asn,
        version: Version,
    ) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            self.remove_where(|asn, record| asn >= point && record.version < version);
            Ok(())
        })
    }

    fn delete_record(&self, asn: Asn, version: Version) -> BoxFuture<'_, OverlayResult<()>> {
        Box::pin(async move {
            let matches = self
                .log
                .lock()
                .records
                .get(&asn)
                .is_some_and(|record| record.version == version);
            if !matches {
                return Err(OverlayError::NotFound);
            }
            self.remove_where(|candidate, record| candidate == asn && record.version == version);
            Ok(())
        })
    }
}
