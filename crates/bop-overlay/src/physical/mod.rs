//! Contract of the physical append-only log the overlay is layered on.
//!
//! The overlay never touches files itself. It drives implementations of
//! [`PhysicalLogStream`] (one per shared-stream view or dedicated log) and
//! [`PhysicalLogContainer`] (the thing streams live in), selected at
//! construction. [`memory`] provides an in-memory implementation of the
//! contract and [`faulty`] a fault-injecting wrapper for tests.

pub mod faulty;
pub mod memory;

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::config::{Asn, StreamId, Version};
use crate::error::OverlayResult;

pub use faulty::{FaultPlan, FaultyLogContainer, FaultyLogStream};
pub use memory::{MemoryLogContainer, MemoryLogStream};

/// How a read locates its record relative to the requested ASN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadType {
    /// The record starting exactly at the ASN.
    Exact,
    /// The first record starting after the ASN.
    Next,
    /// The last record starting before the ASN.
    Previous,
    /// The record whose byte range contains the ASN.
    Containing,
}

/// Commit state of a physical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordDisposition {
    /// The write started but has not committed.
    Pending,
    Persisted,
}

/// Per-record description returned by range queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub asn: Asn,
    pub version: Version,
    /// Logical payload bytes (the ASN span of the record).
    pub size: u64,
    pub disposition: RecordDisposition,
    pub debug_info: String,
}

impl RecordMetadata {
    pub fn end(&self) -> Asn {
        self.asn.advance(self.size)
    }
}

/// `(lowAsn, highAsn, truncationAsn)` of a physical stream.
///
/// `high` is the ASN of the last record, not its end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordRange {
    pub low: Asn,
    pub high: Asn,
    pub truncation: Asn,
}

/// A record as stored by the physical log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalRecord {
    pub asn: Asn,
    pub version: Version,
    pub disposition: RecordDisposition,
    /// Logical payload bytes covered by the record.
    pub size: u64,
    pub meta: Bytes,
    pub data: Bytes,
}

impl PhysicalRecord {
    pub fn end(&self) -> Asn {
        self.asn.advance(self.size)
    }
}

/// An append-only, version-stamped, ASN-addressed record store.
///
/// Writes carry the record's logical `size` (its ASN span) alongside the two
/// buffers, since the metadata block is fixed-size and opaque to the log.
pub trait PhysicalLogStream: Send + Sync {
    fn stream_id(&self) -> StreamId;

    fn write(
        &self,
        asn: Asn,
        version: Version,
        size: u64,
        meta: Bytes,
        data: Bytes,
    ) -> BoxFuture<'_, OverlayResult<()>>;

    /// Fails with `NotFound` when no record satisfies the request.
    fn read(&self, asn: Asn, read_type: ReadType) -> BoxFuture<'_, OverlayResult<PhysicalRecord>>;

    fn query_record_range(&self) -> BoxFuture<'_, OverlayResult<RecordRange>>;

    /// Records whose start lies in `[low, high]`, in ASN order.
    fn query_records(&self, low: Asn, high: Asn) -> BoxFuture<'_, OverlayResult<Vec<RecordMetadata>>>;

    fn query_record(&self, asn: Asn) -> BoxFuture<'_, OverlayResult<RecordMetadata>>;

    /// Allow every record that ends at or before `point` to be discarded. The
    /// log may go as far as `preferred` if convenient.
    fn truncate(&self, point: Asn, preferred: Asn) -> BoxFuture<'_, OverlayResult<()>>;

    /// Discard every record starting at or after `point` whose version is
    /// below `version`.
    fn truncate_below_version(&self, point: Asn, version: Version)
    -> BoxFuture<'_, OverlayResult<()>>;

    fn delete_record(&self, asn: Asn, version: Version) -> BoxFuture<'_, OverlayResult<()>>;
}

pub type LogStreamHandle = Arc<dyn PhysicalLogStream>;

/// A physical container that hosts streams and persists the overlay's
/// catalog.
pub trait PhysicalLogContainer: Send + Sync {
    /// Bytes available to stream data in the container.
    fn capacity(&self) -> u64;

    /// Largest single record the container accepts.
    fn max_record_bytes(&self) -> u64;

    fn create_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<LogStreamHandle>>;

    fn open_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<LogStreamHandle>>;

    fn delete_stream(&self, stream_id: StreamId) -> BoxFuture<'_, OverlayResult<()>>;

    fn list_streams(&self) -> BoxFuture<'_, OverlayResult<Vec<StreamId>>>;

    /// Load the persisted catalog blob (empty for a fresh container). Fails
    /// with `ContainerCorrupted` when the container cannot be opened.
    fn load_catalog(&self) -> BoxFuture<'_, OverlayResult<Bytes>>;

    fn store_catalog(&self, catalog: Bytes) -> BoxFuture<'_, OverlayResult<()>>;
}

pub type LogContainerHandle = Arc<dyn PhysicalLogContainer>;
