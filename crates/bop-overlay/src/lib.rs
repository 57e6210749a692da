//! Dual-tier write-ahead log overlay.
//!
//! Each logical stream is backed by a dedicated physical log plus a share of
//! one container-wide shared log. Small writes are acknowledged as soon as
//! they reach the shared log and are coalesced into larger dedicated-log
//! records in the background; the shared log is truncated behind them. On
//! open, content that only made it to the shared log is destaged into the
//! dedicated log so readers see one consistent stream.

pub mod allocator;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod flush;
pub mod metrics;
pub mod overlay;
pub mod physical;
pub mod quota;
pub mod record;
pub mod stream;
pub mod test_support;

pub use allocator::{BufferLease, ThrottledBufferAllocator};
pub use config::{
    Asn, CoalesceConfig, METADATA_BLOCK_MIN_BYTES, OverlayConfig, RetryPolicy, StreamId,
    UNLIMITED_THROTTLE, Version,
};
pub use error::{OverlayError, OverlayResult, SuspendKind};
pub use metrics::{
    AdmissionMetrics, AdmissionMetricsSnapshot, StreamMetrics, StreamMetricsSnapshot,
};
pub use overlay::{BackupReader, Catalog, CatalogEntry, LogOverlay, StreamState};
pub use physical::{
    FaultPlan, FaultyLogContainer, FaultyLogStream, LogContainerHandle, LogStreamHandle,
    MemoryLogContainer, MemoryLogStream, PhysicalLogContainer, PhysicalLogStream, PhysicalRecord,
    ReadType, RecordDisposition, RecordMetadata, RecordRange,
};
pub use quota::{QuotaTable, SharedQuotas};
pub use record::{DecodedRecord, EncodedRecord, RecordCodec, RecordFlags};
pub use stream::{
    ReadRecord, RecordSource, Recovered, StreamOverlay, WriteOutcome, WriteRequest, WriteRoute,
};
