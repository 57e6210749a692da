use bytes::Bytes;
use tracing::debug;

use crate::config::{Asn, StreamId};
use crate::error::{OverlayError, OverlayResult};
use crate::physical::{
    LogContainerHandle, LogStreamHandle, ReadType, RecordDisposition, RecordMetadata, RecordRange,
};
use crate::record::RecordCodec;
use crate::stream::ReadRecord;
use crate::stream::read::{Origin, assemble_contiguous, physical_candidate};

/// Read-only access to a stream's backup copy of its dedicated log, used
/// when the primary container cannot be opened.
pub struct BackupReader {
    stream_id: StreamId,
    log: LogStreamHandle,
    codec: RecordCodec,
}

impl BackupReader {
    pub async fn open(
        container: &LogContainerHandle,
        stream_id: StreamId,
        metadata_block_bytes: u32,
    ) -> OverlayResult<Self> {
        let log = container.open_stream(stream_id).await?;
        debug!(stream = stream_id.get(), "backup opened for reading");
        Ok(Self {
            stream_id,
            log,
            codec: RecordCodec::new(metadata_block_bytes),
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub async fn read(&self, asn: Asn, read_type: ReadType) -> OverlayResult<ReadRecord> {
        physical_candidate(&self.log, &self.codec, Origin::Dedicated, asn, read_type)
            .await?
            .map(|candidate| candidate.record)
            .ok_or(OverlayError::NotFound)
    }

    pub async fn multi_record_read(&self, start: Asn, limit: usize) -> OverlayResult<Bytes> {
        assemble_contiguous(self.stream_id, start, limit, move |asn| async move {
            self.read(asn, ReadType::Exact)
                .await
                .map(|record| record.data)
        })
        .await
    }

    pub async fn query_records(&self, low: Asn, high: Asn) -> OverlayResult<Vec<RecordMetadata>> {
        let mut records = self.log.query_records(low, high).await?;
        records.retain(|meta| meta.disposition == RecordDisposition::Persisted);
        Ok(records)
    }

    pub async fn query_record_range(&self) -> OverlayResult<RecordRange> {
        self.log.query_record_range().await
    }
}

/// Copy every persisted record of `source` into `target` unchanged.
pub(crate) async fn copy_records(
    source: &LogStreamHandle,
    target: &LogStreamHandle,
) -> OverlayResult<u64> {
    let mut copied = 0;
    for meta in source.query_records(Asn::default(), Asn::MAX).await? {
        if meta.disposition != RecordDisposition::Persisted {
            continue;
        }
        let record = match source.read(meta.asn, ReadType::Exact).await {
            Ok(record) => record,
            // Truncated while we were copying.
            Err(OverlayError::NotFound) => continue,
            Err(err) => return Err(err),
        };
        target
            .write(record.asn, record.version, record.size, record.meta, record.data)
            .await?;
        copied += 1;
    }
    Ok(copied)
}
