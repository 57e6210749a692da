use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{Asn, StreamId, Version};
use crate::error::{OverlayError, OverlayResult};
use crate::metrics::StreamMetrics;
use crate::physical::LogStreamHandle;

#[derive(Debug, Clone, Copy)]
struct SharedEntry {
    end: Asn,
    version: Version,
    bytes: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: BTreeMap<Asn, SharedEntry>,
    used: u64,
    truncated_to: Asn,
}

/// A stream's footprint in the shared log: which records it holds there,
/// how many bytes they take against its quota, and how far it has been
/// truncated.
#[derive(Debug, Default)]
pub struct SharedLedger {
    state: Mutex<LedgerState>,
}

impl SharedLedger {
    pub fn new(truncated_to: Asn) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                truncated_to,
                ..LedgerState::default()
            }),
        }
    }

    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    pub fn truncated_to(&self) -> Asn {
        self.state.lock().truncated_to
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn record_write(&self, asn: Asn, end: Asn, version: Version, bytes: u64) {
        let mut state = self.state.lock();
        if let Some(replaced) = state.entries.insert(asn, SharedEntry { end, version, bytes }) {
            state.used = state.used.saturating_sub(replaced.bytes);
        }
        state.used += bytes;
    }

    /// Delete every shared record that reaches past `point`.
    ///
    /// Callers guarantee the bytes below `point` are durable on the
    /// dedicated log, so a record straddling `point` goes as well.
    pub(crate) async fn discard_from(
        &self,
        stream_id: StreamId,
        shared: &LogStreamHandle,
        point: Asn,
    ) -> OverlayResult<usize> {
        let doomed: Vec<(Asn, SharedEntry)> = self
            .state
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.end > point)
            .map(|(asn, entry)| (*asn, *entry))
            .collect();
        for (asn, entry) in &doomed {
            match shared.delete_record(*asn, entry.version).await {
                Ok(()) | Err(OverlayError::NotFound) => {}
                Err(err) => return Err(err),
            }
            self.forget(*asn);
        }
        if !doomed.is_empty() {
            debug!(
                stream = stream_id.get(),
                asn = point.get(),
                records = doomed.len(),
                "discarded shared records past truncate point"
            );
        }
        Ok(doomed.len())
    }

    fn forget(&self, asn: Asn) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(&asn) {
            state.used = state.used.saturating_sub(entry.bytes);
        }
    }

    /// Truncate the shared log up to `point` if that moves it forward.
    pub(crate) async fn reclaim(
        &self,
        stream_id: StreamId,
        shared: &LogStreamHandle,
        point: Asn,
        metrics: &StreamMetrics,
    ) -> OverlayResult<bool> {
        if point <= self.truncated_to() {
            return Ok(false);
        }
        shared.truncate(point, point).await?;
        let mut state = self.state.lock();
        let reclaimed: Vec<Asn> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.end <= point)
            .map(|(asn, _)| *asn)
            .collect();
        let mut freed = 0;
        for asn in &reclaimed {
            if let Some(entry) = state.entries.remove(asn) {
                freed += entry.bytes;
            }
        }
        state.used = state.used.saturating_sub(freed);
        if point > state.truncated_to {
            state.truncated_to = point;
        }
        metrics.incr_shared_truncation();
        trace!(
            stream = stream_id.get(),
            point = point.get(),
            records = reclaimed.len(),
            freed,
            used = state.used,
            "shared log truncated"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::{MemoryLogContainer, PhysicalLogContainer};
    use bytes::Bytes;

    async fn shared_with(records: &[(u64, u64, u64)]) -> (LogStreamHandle, SharedLedger) {
        let container = MemoryLogContainer::unbounded();
        let shared = container.create_stream(StreamId::new(1)).await.expect("create");
        let ledger = SharedLedger::new(Asn::new(0));
        for (asn, end, version) in records {
            let len = end - asn;
            shared
                .write(
                    Asn::new(*asn),
                    Version::new(*version),
                    len,
                    Bytes::new(),
                    Bytes::from(vec![0u8; len as usize]),
                )
                .await
                .expect("write");
            ledger.record_write(Asn::new(*asn), Asn::new(*end), Version::new(*version), len);
        }
        (shared, ledger)
    }

    #[tokio::test]
    async fn reclaim_frees_quota_of_truncated_records() {
        let (shared, ledger) = shared_with(&[(0, 10, 1), (10, 20, 2), (20, 30, 3)]).await;
        let metrics = StreamMetrics::default();
        assert_eq!(ledger.used(), 30);
        let moved = ledger
            .reclaim(StreamId::new(1), &shared, Asn::new(20), &metrics)
            .await
            .expect("reclaim");
        assert!(moved);
        assert_eq!(ledger.used(), 10);
        assert_eq!(ledger.truncated_to(), Asn::new(20));
        assert!(
            !ledger
                .reclaim(StreamId::new(1), &shared, Asn::new(15), &metrics)
                .await
                .expect("no-op")
        );
        assert_eq!(metrics.snapshot().shared_truncations, 1);
    }

    #[tokio::test]
    async fn discard_from_removes_straddler_and_tail() {
        let (shared, ledger) = shared_with(&[(0, 10, 1), (10, 20, 2), (20, 30, 3)]).await;
        let removed = ledger
            .discard_from(StreamId::new(1), &shared, Asn::new(15))
            .await
            .expect("discard");
        assert_eq!(removed, 2);
        assert_eq!(ledger.used(), 10);
        let left = shared
            .query_records(Asn::new(0), Asn::MAX)
            .await
            .expect("query");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].asn, Asn::new(0));
    }
}
