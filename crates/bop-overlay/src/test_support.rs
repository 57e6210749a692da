//! Helpers shared by unit and integration tests: in-memory overlays and raw
//! record injection for crafting log layouts directly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{Asn, CoalesceConfig, OverlayConfig, RetryPolicy, StreamId, Version};
use crate::error::OverlayResult;
use crate::overlay::LogOverlay;
use crate::physical::{
    FaultPlan, FaultyLogContainer, LogContainerHandle, LogStreamHandle, MemoryLogContainer,
    PhysicalLogContainer,
};
use crate::record::{RecordCodec, RecordFlags};

/// Metadata block size used by [`fast_config`].
pub const TEST_BLOCK_BYTES: u32 = 256;

/// The three in-memory containers behind a test overlay, kept so a test can
/// inspect them or reopen an overlay over them after a simulated restart.
#[derive(Clone)]
pub struct MemoryContainers {
    pub shared: MemoryLogContainer,
    pub dedicated: MemoryLogContainer,
    pub backup: MemoryLogContainer,
}

impl Default for MemoryContainers {
    fn default() -> Self {
        Self::with_shared(MemoryLogContainer::unbounded())
    }
}

impl MemoryContainers {
    pub fn with_shared(shared: MemoryLogContainer) -> Self {
        Self {
            shared,
            dedicated: MemoryLogContainer::unbounded(),
            backup: MemoryLogContainer::unbounded(),
        }
    }

    pub async fn open(&self, config: OverlayConfig) -> OverlayResult<LogOverlay> {
        LogOverlay::open(
            config,
            Arc::new(self.shared.clone()),
            Arc::new(self.dedicated.clone()),
            Some(self.backup_handle()),
        )
        .await
    }

    /// Open the overlay with every shared and dedicated stream running under
    /// a fault plan.
    pub async fn open_faulty(
        &self,
        config: OverlayConfig,
        shared_plan: Arc<FaultPlan>,
        dedicated_plan: Arc<FaultPlan>,
    ) -> OverlayResult<LogOverlay> {
        let shared: LogContainerHandle = Arc::new(self.shared.clone());
        let dedicated: LogContainerHandle = Arc::new(self.dedicated.clone());
        LogOverlay::open(
            config,
            FaultyLogContainer::wrap(shared, shared_plan),
            FaultyLogContainer::wrap(dedicated, dedicated_plan),
            Some(self.backup_handle()),
        )
        .await
    }

    pub fn backup_handle(&self) -> LogContainerHandle {
        Arc::new(self.backup.clone())
    }

    /// Raw shared-log view of a stream, bypassing the overlay.
    pub async fn shared_log(&self, stream_id: StreamId) -> OverlayResult<LogStreamHandle> {
        self.shared.open_stream(stream_id).await
    }

    /// Raw dedicated-log view of a stream, bypassing the overlay.
    pub async fn dedicated_log(&self, stream_id: StreamId) -> OverlayResult<LogStreamHandle> {
        self.dedicated.open_stream(stream_id).await
    }
}

/// Small blocks, manual flushing and millisecond retries.
pub fn fast_config() -> OverlayConfig {
    OverlayConfig::default()
        .with_metadata_block_bytes(TEST_BLOCK_BYTES)
        .with_coalesce(
            CoalesceConfig::default()
                .with_max_record_bytes(1024)
                .with_flush_interval(Duration::ZERO),
        )
        .with_retry(
            RetryPolicy::new(3, Duration::from_millis(1)).with_max_delay(Duration::from_millis(2)),
        )
}

/// Fresh unbounded containers and an overlay opened over them.
pub async fn memory_overlay(
    config: OverlayConfig,
) -> OverlayResult<(LogOverlay, MemoryContainers)> {
    let containers = MemoryContainers::default();
    let overlay = containers.open(config).await?;
    Ok((overlay, containers))
}

/// Write an encoded single-record block straight into a physical log,
/// bypassing the overlay.
pub async fn write_raw(
    log: &LogStreamHandle,
    asn: u64,
    version: u64,
    payload: &[u8],
    block_bytes: u32,
) -> OverlayResult<()> {
    let stream_id: StreamId = log.stream_id();
    let encoded = RecordCodec::new(block_bytes).encode(
        stream_id,
        Asn::new(asn),
        Version::new(version),
        RecordFlags::END_OF_LOGICAL_RECORD,
        &[],
        &[Bytes::copy_from_slice(payload)],
    )?;
    log.write(
        Asn::new(asn),
        Version::new(version),
        payload.len() as u64,
        encoded.meta,
        encoded.data,
    )
    .await
}

pub fn fill(byte: u8, len: usize) -> Bytes {
    Bytes::from(vec![byte; len])
}
