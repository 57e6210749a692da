//! Physical record layout.
//!
//! Every physical record is a fixed-size metadata block plus an optional
//! overflow data buffer:
//!
//! ```text
//! metadata block (metadata_block_bytes)
//! ┌───────────────────────────────┐ 0
//! │ VerificationHeader     16 B   │ magic, block size, record token
//! ├───────────────────────────────┤ 16
//! │ MetadataBlockHeader     8 B   │ offset to stream header, flags
//! ├───────────────────────────────┤ 24
//! │ StreamBlockHeader      56 B   │ signature .. header crc64
//! ├───────────────────────────────┤ 80
//! │ caller metadata               │
//! │ embedded payload prefix       │
//! │ zero padding                  │
//! └───────────────────────────────┘
//! overflow buffer: payload bytes that did not fit the block
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use crc64fast_nvme::Digest;

use crate::config::{Asn, StreamId, Version};
use crate::error::{OverlayError, OverlayResult};

pub(crate) const VERIFICATION_HEADER_SIZE: usize = 16;
pub(crate) const BLOCK_HEADER_SIZE: usize = 8;
pub(crate) const STREAM_HEADER_SIZE: usize = 56;
/// Bytes of the metadata block consumed by the three headers.
pub const RECORD_HEADERS_SIZE: usize =
    VERIFICATION_HEADER_SIZE + BLOCK_HEADER_SIZE + STREAM_HEADER_SIZE;

const VERIFICATION_MAGIC: u32 = 0x4F56_4C52; // "OVLR"
const STREAM_SIGNATURE: u64 = 0x5354_524D_424C_4B31; // "STRMBLK1"
const HEADER_CRC_OFFSET: usize = RECORD_HEADERS_SIZE - 8;

/// Flags carried in the metadata block header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags(u32);

impl RecordFlags {
    /// The record ends a caller-visible logical record (the barrier).
    pub const END_OF_LOGICAL_RECORD: RecordFlags = RecordFlags(0x1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn barrier(is_barrier: bool) -> Self {
        if is_barrier {
            Self::END_OF_LOGICAL_RECORD
        } else {
            Self::empty()
        }
    }

    pub fn is_barrier(self) -> bool {
        self.0 & Self::END_OF_LOGICAL_RECORD.0 != 0
    }
}

/// Integrity token over the record key; detects blocks that belong to a
/// different stream or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationHeader {
    pub block_size: u32,
    pub record_token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataBlockHeader {
    pub offset_to_stream_header: u32,
    pub flags: RecordFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBlockHeader {
    pub signature: u64,
    pub stream_id: StreamId,
    pub stream_offset: Asn,
    pub highest_operation_id: Version,
    pub data_size: u32,
    pub metadata_size: u32,
    pub data_crc64: u64,
    pub header_crc64: u64,
}

/// The two buffers handed to [`crate::PhysicalLogStream::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    pub meta: Bytes,
    pub data: Bytes,
}

impl EncodedRecord {
    /// Bytes the record occupies in a physical log.
    pub fn physical_size(&self) -> u64 {
        (self.meta.len() + self.data.len()) as u64
    }
}

/// A record as the overlay sees it after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub asn: Asn,
    pub version: Version,
    pub flags: RecordFlags,
    pub metadata: Bytes,
    pub data: Bytes,
}

impl DecodedRecord {
    pub fn end(&self) -> Asn {
        self.asn.advance(self.data.len() as u64)
    }
}

/// Encodes and decodes the fixed metadata block layout for one block size.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    block_bytes: usize,
}

impl RecordCodec {
    pub fn new(block_bytes: u32) -> Self {
        Self {
            block_bytes: block_bytes as usize,
        }
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// Largest caller metadata a record can carry.
    pub fn max_metadata_bytes(&self) -> usize {
        self.block_bytes.saturating_sub(RECORD_HEADERS_SIZE)
    }

    /// Encode a record whose payload is the concatenation of `segments`.
    pub fn encode(
        &self,
        stream_id: StreamId,
        asn: Asn,
        version: Version,
        flags: RecordFlags,
        metadata: &[u8],
        segments: &[Bytes],
    ) -> OverlayResult<EncodedRecord> {
        if metadata.len() > self.max_metadata_bytes() {
            return Err(OverlayError::invalid_parameter(format!(
                "metadata of {} bytes exceeds block capacity {}",
                metadata.len(),
                self.max_metadata_bytes()
            )));
        }
        let data_size: usize = segments.iter().map(Bytes::len).sum();
        if data_size > u32::MAX as usize {
            return Err(OverlayError::invalid_parameter(format!(
                "record payload of {data_size} bytes exceeds u32 range"
            )));
        }

        let mut data_digest = Digest::new();
        data_digest.write(metadata);
        for segment in segments {
            data_digest.write(segment);
        }

        let mut block = BytesMut::with_capacity(self.block_bytes);
        block.put_u32_le(VERIFICATION_MAGIC);
        block.put_u32_le(self.block_bytes as u32);
        block.put_u64_le(record_token(stream_id, asn, version));

        block.put_u32_le((VERIFICATION_HEADER_SIZE + BLOCK_HEADER_SIZE) as u32);
        block.put_u32_le(flags.bits());

        block.put_u64_le(STREAM_SIGNATURE);
        block.put_u64_le(stream_id.get());
        block.put_u64_le(asn.get());
        block.put_u64_le(version.get());
        block.put_u32_le(data_size as u32);
        block.put_u32_le(metadata.len() as u32);
        block.put_u64_le(data_digest.sum64());
        block.put_u64_le(0);
        let header_crc = crc64(&block[..RECORD_HEADERS_SIZE]);
        block[HEADER_CRC_OFFSET..RECORD_HEADERS_SIZE].copy_from_slice(&header_crc.to_le_bytes());

        block.put_slice(metadata);

        let mut embed_room = self.block_bytes - block.len();
        let mut overflow = BytesMut::new();
        for segment in segments {
            let embedded = embed_room.min(segment.len());
            block.put_slice(&segment[..embedded]);
            embed_room -= embedded;
            if embedded < segment.len() {
                overflow.put_slice(&segment[embedded..]);
            }
        }
        block.resize(self.block_bytes, 0);

        Ok(EncodedRecord {
            meta: block.freeze(),
            data: overflow.freeze(),
        })
    }

    /// Parse and verify the headers only.
    pub fn decode_headers(
        &self,
        meta: &[u8],
    ) -> OverlayResult<(VerificationHeader, MetadataBlockHeader, StreamBlockHeader)> {
        if meta.len() < RECORD_HEADERS_SIZE {
            return Err(OverlayError::corrupted(format!(
                "metadata block of {} bytes is shorter than its headers",
                meta.len()
            )));
        }
        let magic = read_u32(meta, 0);
        if magic != VERIFICATION_MAGIC {
            return Err(OverlayError::corrupted(format!(
                "bad verification magic {magic:#x}"
            )));
        }
        let verification = VerificationHeader {
            block_size: read_u32(meta, 4),
            record_token: read_u64(meta, 8),
        };
        if verification.block_size as usize != meta.len() {
            return Err(OverlayError::corrupted(format!(
                "block size {} does not match buffer of {} bytes",
                verification.block_size,
                meta.len()
            )));
        }
        let block = MetadataBlockHeader {
            offset_to_stream_header: read_u32(meta, 16),
            flags: RecordFlags::from_bits(read_u32(meta, 20)),
        };
        let offset = block.offset_to_stream_header as usize;
        if offset != VERIFICATION_HEADER_SIZE + BLOCK_HEADER_SIZE {
            return Err(OverlayError::corrupted(format!(
                "unexpected stream header offset {offset}"
            )));
        }
        let stream = StreamBlockHeader {
            signature: read_u64(meta, offset),
            stream_id: StreamId::new(read_u64(meta, offset + 8)),
            stream_offset: Asn::new(read_u64(meta, offset + 16)),
            highest_operation_id: Version::new(read_u64(meta, offset + 24)),
            data_size: read_u32(meta, offset + 32),
            metadata_size: read_u32(meta, offset + 36),
            data_crc64: read_u64(meta, offset + 40),
            header_crc64: read_u64(meta, offset + 48),
        };
        if stream.signature != STREAM_SIGNATURE {
            return Err(OverlayError::corrupted("bad stream header signature"));
        }
        let mut scratch = [0u8; RECORD_HEADERS_SIZE];
        scratch.copy_from_slice(&meta[..RECORD_HEADERS_SIZE]);
        scratch[HEADER_CRC_OFFSET..].fill(0);
        if crc64(&scratch) != stream.header_crc64 {
            return Err(OverlayError::corrupted("stream header checksum mismatch"));
        }
        let expected_token = record_token(
            stream.stream_id,
            stream.stream_offset,
            stream.highest_operation_id,
        );
        if verification.record_token != expected_token {
            return Err(OverlayError::corrupted("record token mismatch"));
        }
        Ok((verification, block, stream))
    }

    /// Decode a record, verifying that it belongs to `stream_id`.
    pub fn decode(&self, stream_id: StreamId, meta: &Bytes, data: &Bytes) -> OverlayResult<DecodedRecord> {
        let (_, block, header) = self.decode_headers(meta)?;
        if header.stream_id != stream_id {
            return Err(OverlayError::corrupted(format!(
                "record belongs to stream {}, expected {}",
                header.stream_id, stream_id
            )));
        }
        let metadata_start = RECORD_HEADERS_SIZE;
        let metadata_end = metadata_start + header.metadata_size as usize;
        if metadata_end > meta.len() {
            return Err(OverlayError::corrupted("metadata overruns block"));
        }
        let data_size = header.data_size as usize;
        let embedded = data_size
            .saturating_sub(data.len())
            .min(meta.len() - metadata_end);
        if embedded + data.len() != data_size {
            return Err(OverlayError::corrupted(format!(
                "payload size mismatch: header {} vs embedded {} + overflow {}",
                data_size,
                embedded,
                data.len()
            )));
        }
        let metadata = meta.slice(metadata_start..metadata_end);
        let payload = if embedded == 0 {
            data.clone()
        } else if data.is_empty() {
            meta.slice(metadata_end..metadata_end + embedded)
        } else {
            let mut joined = BytesMut::with_capacity(data_size);
            joined.put_slice(&meta[metadata_end..metadata_end + embedded]);
            joined.put_slice(data);
            joined.freeze()
        };

        let mut digest = Digest::new();
        digest.write(&metadata);
        digest.write(&payload);
        if digest.sum64() != header.data_crc64 {
            return Err(OverlayError::corrupted(format!(
                "data checksum mismatch at asn {}",
                header.stream_offset
            )));
        }

        Ok(DecodedRecord {
            asn: header.stream_offset,
            version: header.highest_operation_id,
            flags: block.flags,
            metadata,
            data: payload,
        })
    }
}

fn record_token(stream_id: StreamId, asn: Asn, version: Version) -> u64 {
    let mut digest = Digest::new();
    digest.write(&stream_id.get().to_le_bytes());
    digest.write(&asn.get().to_le_bytes());
    digest.write(&version.get().to_le_bytes());
    digest.sum64()
}

fn crc64(bytes: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(bytes);
    digest.sum64()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
