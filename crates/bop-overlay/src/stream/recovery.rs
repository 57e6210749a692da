//! Reconciles a stream's shared and dedicated logs when it is opened.
//!
//! The dedicated log is the record of truth for everything it holds. Shared
//! records that carry newer content are copied ("destaged") into it in
//! version order, after which the shared log is truncated past them.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::coalesce::discard_dedicated_tail;
use crate::config::{Asn, RetryPolicy, StreamId, Version};
use crate::error::{OverlayError, OverlayResult};
use crate::flush::{RetryBudget, retry_physical};
use crate::metrics::StreamMetrics;
use crate::physical::{LogStreamHandle, ReadType, RecordDisposition, RecordMetadata};
use crate::record::RecordCodec;

/// Where a stream stands once recovery has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    /// End of the dedicated content, `None` for a stream without data.
    pub tail: Option<Asn>,
    pub high_version: Version,
    pub destaged: u64,
    pub shared_truncated_to: Asn,
}

pub(crate) struct RecoveryContext<'a> {
    pub(crate) stream_id: StreamId,
    pub(crate) shared: &'a LogStreamHandle,
    pub(crate) dedicated: &'a LogStreamHandle,
    pub(crate) codec: &'a RecordCodec,
    pub(crate) retry: &'a RetryPolicy,
    pub(crate) shutdown: &'a CancellationToken,
    pub(crate) metrics: &'a StreamMetrics,
}

pub(crate) async fn recover(ctx: RecoveryContext<'_>) -> OverlayResult<Recovered> {
    let dedicated_records = drop_pending(ctx.dedicated).await?;
    // Content below the dedicated truncation point was released on purpose
    // and must not come back from the shared log.
    let released = ctx.dedicated.query_record_range().await?.truncation;
    let floor = |end: Option<Asn>| match end {
        Some(end) => Some(end.max(released)),
        None if released > Asn::default() => Some(released),
        None => None,
    };
    let mut cursor = floor(dedicated_records.iter().map(RecordMetadata::end).max());
    let mut high_version = dedicated_records
        .iter()
        .map(|record| record.version)
        .max()
        .unwrap_or_default();

    let mut shared_records = drop_pending(ctx.shared).await?;
    let shared_end = shared_records.iter().map(RecordMetadata::end).max();
    shared_records.sort_by_key(|record| (record.version, record.asn));

    let mut destaged = 0u64;
    for record in &shared_records {
        if record.end() <= released {
            trace!(
                stream = ctx.stream_id.get(),
                asn = record.asn.get(),
                truncation = released.get(),
                "shared record below dedicated truncation"
            );
            high_version = high_version.max(record.version);
            continue;
        }
        if covered(ctx.dedicated, record).await? {
            continue;
        }
        let resume = cursor.unwrap_or(record.asn);
        if record.asn > resume {
            warn!(
                stream = ctx.stream_id.get(),
                dedicated_end = resume.get(),
                shared_asn = record.asn.get(),
                "gap between dedicated and shared content"
            );
            return Err(OverlayError::structure_fault(
                ctx.stream_id,
                format!(
                    "dedicated log ends at {resume} but shared content resumes at {}",
                    record.asn
                ),
            ));
        }
        if record.asn < resume {
            // A tail overwrite that never reached the dedicated log.
            discard_dedicated_tail(
                ctx.dedicated,
                ctx.codec,
                ctx.retry,
                ctx.shutdown,
                record.asn,
                record.version,
            )
            .await?;
        }
        destage(&ctx, record).await?;
        destaged += 1;
        high_version = high_version.max(record.version);
        cursor = floor(dedicated_end(ctx.dedicated).await?);
    }

    let truncation = ctx.shared.query_record_range().await?.truncation;
    let mut shared_truncated_to = truncation;
    if let Some(end) = shared_end {
        let point = cursor.map_or(end, |cursor| cursor.max(end));
        ctx.shared.truncate(point, point).await?;
        shared_truncated_to = point.max(truncation);
    }
    ctx.metrics.add_destaged(destaged);

    if destaged > 0 {
        info!(
            stream = ctx.stream_id.get(),
            destaged,
            tail = cursor.map(Asn::get),
            version = high_version.get(),
            "destaged shared records into dedicated log"
        );
    } else {
        debug!(
            stream = ctx.stream_id.get(),
            tail = cursor.map(Asn::get),
            "stream recovered without destaging"
        );
    }
    Ok(Recovered {
        tail: cursor,
        high_version,
        destaged,
        shared_truncated_to,
    })
}

/// Delete records whose writes never committed; returns the persisted rest.
async fn drop_pending(log: &LogStreamHandle) -> OverlayResult<Vec<RecordMetadata>> {
    let records = log.query_records(Asn::default(), Asn::MAX).await?;
    let mut persisted = Vec::with_capacity(records.len());
    for record in records {
        if record.disposition == RecordDisposition::Persisted {
            persisted.push(record);
            continue;
        }
        debug!(
            stream = log.stream_id().get(),
            asn = record.asn.get(),
            version = record.version.get(),
            "discarding uncommitted record"
        );
        match log.delete_record(record.asn, record.version).await {
            Ok(()) | Err(OverlayError::NotFound) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(persisted)
}

/// The dedicated log already holds content at least as new as `record`.
async fn covered(dedicated: &LogStreamHandle, record: &RecordMetadata) -> OverlayResult<bool> {
    match dedicated.read(record.asn, ReadType::Containing).await {
        Ok(found) => Ok(found.disposition == RecordDisposition::Persisted
            && found.asn <= record.asn
            && found.end() > record.asn
            && found.version >= record.version),
        Err(OverlayError::NotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn dedicated_end(dedicated: &LogStreamHandle) -> OverlayResult<Option<Asn>> {
    let records = dedicated.query_records(Asn::default(), Asn::MAX).await?;
    Ok(records.iter().map(RecordMetadata::end).max())
}

async fn destage(ctx: &RecoveryContext<'_>, record: &RecordMetadata) -> OverlayResult<()> {
    let found = ctx.shared.read(record.asn, ReadType::Exact).await?;
    // Refuse to propagate a damaged record into the dedicated log.
    ctx.codec.decode(ctx.stream_id, &found.meta, &found.data)?;
    let (result, retries) = retry_physical(
        ctx.retry,
        RetryBudget::Bounded,
        ctx.shutdown,
        "destage",
        || {
            ctx.dedicated.write(
                found.asn,
                found.version,
                found.size,
                found.meta.clone(),
                found.data.clone(),
            )
        },
    )
    .await;
    ctx.metrics.add_flush_retries(retries as u64);
    result?;
    debug!(
        stream = ctx.stream_id.get(),
        asn = found.asn.get(),
        version = found.version.get(),
        size = found.size,
        "destaged record"
    );
    Ok(())
}
