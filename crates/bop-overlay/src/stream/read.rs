//! Read resolution across the coalescing buffer and both physical logs.
//!
//! Every read gathers at most one candidate per source, keeps the dedicated
//! side (buffer first, then the dedicated log) unless the shared candidate
//! overlaps it with a strictly higher version, and verifies a physical
//! winner is still there before returning it.

use std::future::Future;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::coalesce::{BlockState, BufferSnapshot};
use crate::config::{Asn, StreamId, Version};
use crate::error::{OverlayError, OverlayResult};
use crate::physical::{LogStreamHandle, PhysicalRecord, ReadType, RecordDisposition};
use crate::record::RecordCodec;

/// Bound on how many pending records a Next/Previous scan steps over.
const MAX_PENDING_SKIPS: usize = 64;

/// Which log a returned record was resolved from. Buffered records report
/// `Dedicated`, their final home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordSource {
    Shared,
    Dedicated,
}

/// Result of a stream read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    /// ASN of the first returned byte. Differs from the requested ASN for
    /// `Next`, `Previous` and `Containing` reads.
    pub asn: Asn,
    pub version: Version,
    pub barrier: bool,
    pub metadata: Bytes,
    pub data: Bytes,
    pub source: RecordSource,
}

impl ReadRecord {
    pub fn end(&self) -> Asn {
        self.asn.advance(self.data.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Buffer(BlockState),
    Dedicated,
    Shared,
}

impl Origin {
    pub(crate) fn source(self) -> RecordSource {
        match self {
            Origin::Shared => RecordSource::Shared,
            Origin::Buffer(_) | Origin::Dedicated => RecordSource::Dedicated,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Origin::Buffer(BlockState::Active) => "buffer:active",
            Origin::Buffer(BlockState::Flushing) => "buffer:flushing",
            Origin::Dedicated => "dedicated",
            Origin::Shared => "shared",
        }
    }
}

/// One source's answer to a read, plus the span of the record backing it.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) record: ReadRecord,
    pub(crate) origin: Origin,
    pub(crate) span_start: Asn,
    pub(crate) span_end: Asn,
}

impl Candidate {
    fn overlaps(&self, other: &Candidate) -> bool {
        self.span_start < other.span_end && other.span_start < self.span_end
    }
}

/// The record `read_type` lands on within the buffered blocks.
pub(crate) fn buffer_candidate(
    snapshot: &BufferSnapshot,
    asn: Asn,
    read_type: ReadType,
) -> Option<Candidate> {
    let block = snapshot.locate(asn, read_type)?;
    let from = match read_type {
        ReadType::Exact => asn,
        _ => block.start(),
    };
    Some(Candidate {
        record: ReadRecord {
            asn: from,
            version: block.version(),
            barrier: block.barrier(),
            metadata: block.metadata(),
            data: block.payload_from(from),
            source: RecordSource::Dedicated,
        },
        origin: Origin::Buffer(block.state()),
        span_start: block.start(),
        span_end: block.end(),
    })
}

/// The persisted record `read_type` lands on in one physical log, decoded.
///
/// `Exact` falls back to the record containing `asn` and slices it, since
/// coalescing folds several caller writes into one physical record.
pub(crate) async fn physical_candidate(
    log: &LogStreamHandle,
    codec: &RecordCodec,
    origin: Origin,
    asn: Asn,
    read_type: ReadType,
) -> OverlayResult<Option<Candidate>> {
    let Some(found) = locate_persisted(log, asn, read_type).await? else {
        return Ok(None);
    };
    let decoded = codec.decode(log.stream_id(), &found.meta, &found.data)?;
    let (from, data) = if read_type == ReadType::Exact && found.asn < asn {
        let skip = (asn.get() - found.asn.get()) as usize;
        if skip >= decoded.data.len() {
            return Ok(None);
        }
        (asn, decoded.data.slice(skip..))
    } else {
        (found.asn, decoded.data)
    };
    Ok(Some(Candidate {
        record: ReadRecord {
            asn: from,
            version: found.version,
            barrier: decoded.flags.is_barrier(),
            metadata: decoded.metadata,
            data,
            source: origin.source(),
        },
        origin,
        span_start: found.asn,
        span_end: found.end(),
    }))
}

async fn locate_persisted(
    log: &LogStreamHandle,
    asn: Asn,
    read_type: ReadType,
) -> OverlayResult<Option<PhysicalRecord>> {
    let first = match read_type {
        ReadType::Exact => match log.read(asn, ReadType::Exact).await {
            Err(OverlayError::NotFound) => log.read(asn, ReadType::Containing).await,
            other => other,
        },
        _ => log.read(asn, read_type).await,
    };
    let mut record = match first {
        Ok(record) => record,
        Err(OverlayError::NotFound) => return Ok(None),
        Err(err) => return Err(err),
    };
    for _ in 0..MAX_PENDING_SKIPS {
        if record.disposition == RecordDisposition::Persisted {
            return Ok(Some(record));
        }
        // A pending record hides nothing for a positional read, so step past it.
        let step = match read_type {
            ReadType::Next | ReadType::Previous => read_type,
            ReadType::Exact | ReadType::Containing => return Ok(None),
        };
        record = match log.read(record.asn, step).await {
            Ok(record) => record,
            Err(OverlayError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
    }
    Ok(None)
}

/// Pick between two candidates for the same read; `preferred` wins ties.
pub(crate) fn choose(
    read_type: ReadType,
    preferred: Option<Candidate>,
    other: Option<Candidate>,
) -> Option<Candidate> {
    match (preferred, other) {
        (None, other) => other,
        (preferred, None) => preferred,
        (Some(preferred), Some(other)) => {
            let other_wins = if preferred.overlaps(&other) {
                other.record.version > preferred.record.version
            } else {
                match read_type {
                    ReadType::Next => other.span_start < preferred.span_start,
                    _ => other.span_start > preferred.span_start,
                }
            };
            Some(if other_wins { other } else { preferred })
        }
    }
}

/// Still present with the version it was read at.
pub(crate) async fn confirm(
    log: &LogStreamHandle,
    candidate: &Candidate,
) -> OverlayResult<bool> {
    match log.query_record(candidate.span_start).await {
        Ok(meta) => Ok(meta.version == candidate.record.version
            && meta.disposition == RecordDisposition::Persisted),
        Err(OverlayError::NotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Concatenate the contiguous bytes starting at `start`, up to `limit`.
///
/// `read_at` returns the payload from a given ASN to the end of the record
/// holding it. The first record alone is returned without copying when it
/// satisfies the request.
pub(crate) async fn assemble_contiguous<F, Fut>(
    stream_id: StreamId,
    start: Asn,
    limit: usize,
    mut read_at: F,
) -> OverlayResult<Bytes>
where
    F: FnMut(Asn) -> Fut,
    Fut: Future<Output = OverlayResult<Bytes>>,
{
    if limit == 0 {
        return Err(OverlayError::invalid_parameter(
            "multi-record read needs a non-empty output buffer",
        ));
    }
    let first = read_at(start).await?;
    if first.is_empty() {
        return Err(OverlayError::NotFound);
    }
    if first.len() >= limit {
        return Ok(first.slice(..limit));
    }
    let mut cursor = start.advance(first.len() as u64);
    let mut pieces = vec![first];
    let mut total = pieces[0].len();
    while total < limit {
        let piece = match read_at(cursor).await {
            Ok(piece) if !piece.is_empty() => piece,
            Ok(_) | Err(OverlayError::NotFound) => break,
            Err(err) => return Err(err),
        };
        let take = piece.len().min(limit - total);
        cursor = cursor.advance(take as u64);
        total += take;
        pieces.push(piece.slice(..take));
    }
    if pieces.len() == 1 {
        return Ok(pieces.swap_remove(0));
    }
    trace!(
        stream = stream_id.get(),
        asn = start.get(),
        pieces = pieces.len(),
        bytes = total,
        "multi-record read assembled"
    );
    let mut joined = BytesMut::with_capacity(total);
    for piece in &pieces {
        joined.put_slice(piece);
    }
    Ok(joined.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(origin: Origin, start: u64, end: u64, version: u64) -> Candidate {
        Candidate {
            record: ReadRecord {
                asn: Asn::new(start),
                version: Version::new(version),
                barrier: true,
                metadata: Bytes::new(),
                data: Bytes::from(vec![0u8; (end - start) as usize]),
                source: origin.source(),
            },
            origin,
            span_start: Asn::new(start),
            span_end: Asn::new(end),
        }
    }

    #[test]
    fn overlapping_candidates_resolve_by_version() {
        let dedicated = candidate(Origin::Dedicated, 0, 10, 5);
        let shared = candidate(Origin::Shared, 0, 10, 5);
        let tie = choose(ReadType::Exact, Some(dedicated.clone()), Some(shared.clone()))
            .expect("tie");
        assert_eq!(tie.origin, Origin::Dedicated);

        let newer = candidate(Origin::Shared, 4, 8, 6);
        let winner = choose(ReadType::Containing, Some(dedicated), Some(newer)).expect("newer");
        assert_eq!(winner.origin, Origin::Shared);
    }

    #[test]
    fn disjoint_candidates_resolve_by_position() {
        let near = candidate(Origin::Dedicated, 10, 20, 1);
        let far = candidate(Origin::Shared, 30, 40, 9);
        let next = choose(ReadType::Next, Some(far.clone()), Some(near.clone())).expect("next");
        assert_eq!(next.span_start, Asn::new(10));
        let previous = choose(ReadType::Previous, Some(near), Some(far)).expect("previous");
        assert_eq!(previous.span_start, Asn::new(30));
    }

    #[tokio::test]
    async fn assembly_stops_at_gap_and_limit() {
        let pieces = |asn: Asn| async move {
            match asn.get() {
                0 => Ok(Bytes::from_static(b"abc")),
                3 => Ok(Bytes::from_static(b"defg")),
                _ => Err(OverlayError::NotFound),
            }
        };
        let all = assemble_contiguous(StreamId::new(1), Asn::new(0), 64, pieces)
            .await
            .expect("assemble");
        assert_eq!(&all[..], b"abcdefg");
        let clipped = assemble_contiguous(StreamId::new(1), Asn::new(0), 5, pieces)
            .await
            .expect("clipped");
        assert_eq!(&clipped[..], b"abcde");
        let fast = assemble_contiguous(StreamId::new(1), Asn::new(0), 2, pieces)
            .await
            .expect("fast path");
        assert_eq!(&fast[..], b"ab");
        assert_eq!(
            assemble_contiguous(StreamId::new(1), Asn::new(9), 4, pieces).await,
            Err(OverlayError::NotFound)
        );
    }
}
