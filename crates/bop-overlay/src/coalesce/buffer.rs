//! Immutable views of buffered and in-flight dedicated records.
//!
//! Readers never lock a block being appended to. They clone an
//! [`Arc`]-backed [`BufferedBlock`] out of the engine, and an append that
//! races with them copies the record list on write instead of mutating it.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::{Asn, Version};
use crate::physical::ReadType;

/// One caller write held in memory until its dedicated copy is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRecord {
    pub asn: Asn,
    pub version: Version,
    pub barrier: bool,
    pub metadata: Bytes,
    pub data: Bytes,
}

impl BufferedRecord {
    pub fn end(&self) -> Asn {
        self.asn.advance(self.data.len() as u64)
    }
}

/// Where a buffered block currently sits in the flush pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Active,
    Flushing,
}

/// A run of contiguous buffered records that becomes one physical record
/// (ASN = first record, version = highest record version).
#[derive(Debug, Clone)]
pub struct BufferedBlock {
    records: Arc<Vec<BufferedRecord>>,
    state: BlockState,
}

impl BufferedBlock {
    pub(crate) fn new(first: BufferedRecord) -> Self {
        Self {
            records: Arc::new(vec![first]),
            state: BlockState::Active,
        }
    }

    pub(crate) fn push(&mut self, record: BufferedRecord) {
        Arc::make_mut(&mut self.records).push(record);
    }

    pub(crate) fn into_flushing(mut self) -> Self {
        self.state = BlockState::Flushing;
        self
    }

    /// Drop content at or after `point`. Returns how many records survive;
    /// a record straddling `point` survives shortened.
    pub(crate) fn truncate_at(&mut self, point: Asn) -> usize {
        let records = Arc::make_mut(&mut self.records);
        records.retain(|record| record.asn < point);
        if let Some(last) = records.last_mut() {
            if last.end() > point {
                let keep = (point.get() - last.asn.get()) as usize;
                last.data = last.data.slice(..keep);
            }
        }
        records.len()
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn records(&self) -> &[BufferedRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn start(&self) -> Asn {
        self.records.first().map_or(Asn::default(), |record| record.asn)
    }

    pub fn end(&self) -> Asn {
        self.records.last().map_or(self.start(), BufferedRecord::end)
    }

    pub fn version(&self) -> Version {
        self.records
            .iter()
            .map(|record| record.version)
            .max()
            .unwrap_or_default()
    }

    pub fn bytes(&self) -> u64 {
        self.end().get() - self.start().get()
    }

    /// A coalesced record carries the barrier and metadata of its last write.
    pub fn barrier(&self) -> bool {
        self.records.last().is_some_and(|record| record.barrier)
    }

    pub fn metadata(&self) -> Bytes {
        self.records
            .last()
            .map(|record| record.metadata.clone())
            .unwrap_or_default()
    }

    pub fn segments(&self) -> Vec<Bytes> {
        self.records.iter().map(|record| record.data.clone()).collect()
    }

    pub fn contains(&self, asn: Asn) -> bool {
        self.start() <= asn && asn < self.end()
    }

    /// Payload bytes from `from` to the block end, zero-copy when a single
    /// record covers them.
    pub fn payload_from(&self, from: Asn) -> Bytes {
        if from >= self.end() {
            return Bytes::new();
        }
        let from = from.max(self.start());
        let first = self
            .records
            .partition_point(|record| record.end() <= from);
        let tail = &self.records[first..];
        let skip = (from.get() - tail[0].asn.get()) as usize;
        if tail.len() == 1 {
            return tail[0].data.slice(skip..);
        }
        let mut joined = BytesMut::with_capacity((self.end().get() - from.get()) as usize);
        joined.put_slice(&tail[0].data[skip..]);
        for record in &tail[1..] {
            joined.put_slice(&record.data);
        }
        joined.freeze()
    }

    pub fn payload(&self) -> Bytes {
        self.payload_from(self.start())
    }
}

/// Point-in-time view of every buffered block of a stream, ordered by ASN.
#[derive(Debug, Clone, Default)]
pub struct BufferSnapshot {
    blocks: Vec<BufferedBlock>,
}

impl BufferSnapshot {
    pub(crate) fn new(mut blocks: Vec<BufferedBlock>) -> Self {
        blocks.retain(|block| !block.is_empty());
        blocks.sort_by_key(BufferedBlock::start);
        Self { blocks }
    }

    pub fn blocks(&self) -> &[BufferedBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The block a read of `read_type` at `asn` lands on.
    ///
    /// `Exact` also matches a block that merely contains `asn`; the caller
    /// slices the payload so the result still starts at `asn`.
    pub fn locate(&self, asn: Asn, read_type: ReadType) -> Option<&BufferedBlock> {
        match read_type {
            ReadType::Exact => self
                .blocks
                .iter()
                .find(|block| block.start() == asn)
                .or_else(|| self.containing(asn)),
            ReadType::Containing => self.containing(asn),
            ReadType::Next => self.blocks.iter().find(|block| block.start() > asn),
            ReadType::Previous => self.blocks.iter().rev().find(|block| block.start() < asn),
        }
    }

    fn containing(&self, asn: Asn) -> Option<&BufferedBlock> {
        // Newest first when an in-flight block and the active one overlap.
        self.blocks
            .iter()
            .filter(|block| block.contains(asn))
            .max_by_key(|block| block.version())
    }
}
