//! Container-level lifecycle for every stream sharing one shared log.
//!
//! [`LogOverlay`] owns the persisted stream catalog, the shared-log quota
//! table and the process-wide buffer allocator. Stream creation and
//! deletion bracket their physical work with catalog updates, so a crash
//! in the middle leaves a `Creating`/`Deleting` entry that the next open
//! purges.

pub mod backup;
pub mod catalog;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::ThrottledBufferAllocator;
use crate::config::{OverlayConfig, StreamId};
use crate::error::{OverlayError, OverlayResult};
use crate::metrics::AdmissionMetricsSnapshot;
use crate::physical::LogContainerHandle;
use crate::quota::{QuotaTable, SharedQuotas};
use crate::stream::{StreamContext, StreamOverlay};

pub use backup::BackupReader;
pub use catalog::{Catalog, CatalogEntry, StreamState};

pub struct LogOverlay {
    config: Arc<OverlayConfig>,
    shared: LogContainerHandle,
    dedicated: LogContainerHandle,
    backup: Option<LogContainerHandle>,
    allocator: ThrottledBufferAllocator,
    quotas: SharedQuotas,
    catalog: tokio::sync::Mutex<Catalog>,
    streams: Mutex<HashMap<StreamId, Arc<StreamOverlay>>>,
    shutdown: CancellationToken,
}

impl LogOverlay {
    /// Open a container pair, purging whatever an interrupted create or
    /// delete left behind.
    ///
    /// Fails with `ContainerCorrupted` when either container or the catalog
    /// cannot be read; no partial state is kept in that case.
    pub async fn open(
        config: OverlayConfig,
        shared: LogContainerHandle,
        dedicated: LogContainerHandle,
        backup: Option<LogContainerHandle>,
    ) -> OverlayResult<Self> {
        config.validate()?;
        let blob = shared.load_catalog().await?;
        dedicated.load_catalog().await?;
        let mut catalog = Catalog::decode(&blob)?;

        let mut purged = 0usize;
        for stream_id in catalog.partial_entries() {
            warn!(
                stream = stream_id.get(),
                "purging stream left partially provisioned"
            );
            purge_physical(&shared, &dedicated, stream_id).await?;
            catalog.remove(stream_id);
            purged += 1;
        }
        for container in [&shared, &dedicated] {
            for stream_id in container.list_streams().await? {
                if catalog.entry(stream_id).is_none() {
                    warn!(stream = stream_id.get(), "purging orphaned physical stream");
                    match container.delete_stream(stream_id).await {
                        Ok(()) | Err(OverlayError::NotFound) => {}
                        Err(err) => return Err(err),
                    }
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            shared.store_catalog(catalog.encode()?).await?;
        }

        let quotas = QuotaTable::shared(QuotaTable::compute(
            shared.capacity(),
            catalog.nominal_sizes(),
        ));
        let allocator = ThrottledBufferAllocator::new(config.buffer_memory_limit)?;
        info!(
            streams = catalog.streams.len(),
            purged,
            capacity = shared.capacity(),
            "log overlay opened"
        );
        Ok(Self {
            config: Arc::new(config),
            shared,
            dedicated,
            backup,
            allocator,
            quotas,
            catalog: tokio::sync::Mutex::new(catalog),
            streams: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn allocator(&self) -> &ThrottledBufferAllocator {
        &self.allocator
    }

    pub fn allocator_metrics(&self) -> AdmissionMetricsSnapshot {
        self.allocator.metrics()
    }

    /// Provision a stream on both containers and open it.
    pub async fn create_stream(
        &self,
        stream_id: StreamId,
        nominal_size: u64,
        alias: Option<&str>,
    ) -> OverlayResult<Arc<StreamOverlay>> {
        self.ensure_open()?;
        if nominal_size == 0 {
            return Err(OverlayError::invalid_parameter(
                "stream nominal size must be non-zero",
            ));
        }
        let mut catalog = self.catalog.lock().await;
        if catalog.entry(stream_id).is_some() {
            return Err(OverlayError::AlreadyExists(format!("stream {stream_id}")));
        }
        if let Some(alias) = alias {
            if catalog.resolve_alias(alias).is_some() {
                return Err(OverlayError::AlreadyExists(format!("alias {alias}")));
            }
        }
        catalog.upsert(CatalogEntry {
            stream_id,
            alias: alias.map(str::to_string),
            nominal_size,
            state: StreamState::Creating,
        });
        self.persist(&catalog).await?;

        let created = async {
            let shared = self.shared.create_stream(stream_id).await?;
            let dedicated = self.dedicated.create_stream(stream_id).await?;
            Ok::<_, OverlayError>((shared, dedicated))
        }
        .await;
        let (shared, dedicated) = match created {
            Ok(handles) => handles,
            Err(err) => {
                warn!(stream = stream_id.get(), error = %err, "stream create failed");
                self.purge_locked(&mut catalog, stream_id).await?;
                return Err(err);
            }
        };

        if let Some(entry) = catalog.entry_mut(stream_id) {
            entry.state = StreamState::Ready;
        }
        self.persist(&catalog).await?;
        self.recompute_quotas(&catalog);
        let stream = StreamOverlay::open(stream_id, shared, dedicated, self.stream_context()).await?;
        self.streams.lock().insert(stream_id, Arc::clone(&stream));
        info!(stream = stream_id.get(), nominal_size, ?alias, "stream created");
        Ok(stream)
    }

    /// Open (recovering if needed) a stream, or return the handle already
    /// open.
    ///
    /// A stream whose catalog entry is partial, whose physical logs are
    /// missing, or whose logs cannot be reconciled is purged; the call then
    /// fails with `NotFound` or the `StructureFault`.
    pub async fn open_stream(&self, stream_id: StreamId) -> OverlayResult<Arc<StreamOverlay>> {
        self.ensure_open()?;
        if let Some(stream) = self.open_handle(stream_id) {
            return Ok(stream);
        }
        let mut catalog = self.catalog.lock().await;
        if let Some(stream) = self.open_handle(stream_id) {
            return Ok(stream);
        }
        let state = catalog
            .entry(stream_id)
            .map(|entry| entry.state)
            .ok_or(OverlayError::NotFound)?;
        if state != StreamState::Ready {
            warn!(
                stream = stream_id.get(),
                ?state,
                "stream provisioning was interrupted"
            );
            self.purge_locked(&mut catalog, stream_id).await?;
            return Err(OverlayError::NotFound);
        }

        let handles = async {
            let shared = self.shared.open_stream(stream_id).await?;
            let dedicated = self.dedicated.open_stream(stream_id).await?;
            Ok::<_, OverlayError>((shared, dedicated))
        }
        .await;
        let (shared, dedicated) = match handles {
            Ok(handles) => handles,
            Err(OverlayError::NotFound) => {
                warn!(stream = stream_id.get(), "stream physical logs are missing");
                self.purge_locked(&mut catalog, stream_id).await?;
                return Err(OverlayError::NotFound);
            }
            Err(err) => return Err(err),
        };

        match StreamOverlay::open(stream_id, shared, dedicated, self.stream_context()).await {
            Ok(stream) => {
                self.recompute_quotas(&catalog);
                self.streams.lock().insert(stream_id, Arc::clone(&stream));
                Ok(stream)
            }
            Err(err @ OverlayError::StructureFault { .. }) => {
                warn!(stream = stream_id.get(), error = %err, "stream cannot be recovered");
                self.purge_locked(&mut catalog, stream_id).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn open_stream_by_alias(&self, alias: &str) -> OverlayResult<Arc<StreamOverlay>> {
        let stream_id = self.resolve_alias(alias).await.ok_or(OverlayError::NotFound)?;
        self.open_stream(stream_id).await
    }

    /// Drain and close an open stream. Its catalog entry stays.
    pub async fn close_stream(&self, stream_id: StreamId) -> OverlayResult<()> {
        let stream = self
            .streams
            .lock()
            .remove(&stream_id)
            .ok_or(OverlayError::NotFound)?;
        stream.close().await
    }

    /// Remove a stream, its alias and all of its physical artifacts.
    pub async fn delete_stream(&self, stream_id: StreamId) -> OverlayResult<()> {
        self.ensure_open()?;
        let mut catalog = self.catalog.lock().await;
        let entry = catalog
            .entry_mut(stream_id)
            .ok_or(OverlayError::NotFound)?;
        entry.state = StreamState::Deleting;
        self.persist(&catalog).await?;

        self.detach(stream_id).await;
        purge_physical(&self.shared, &self.dedicated, stream_id).await?;
        if let Some(backup) = &self.backup {
            match backup.delete_stream(stream_id).await {
                Ok(()) | Err(OverlayError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        catalog.remove(stream_id);
        self.persist(&catalog).await?;
        self.recompute_quotas(&catalog);
        info!(stream = stream_id.get(), "stream deleted");
        Ok(())
    }

    pub async fn set_alias(&self, stream_id: StreamId, alias: &str) -> OverlayResult<()> {
        let mut catalog = self.catalog.lock().await;
        if let Some(owner) = catalog.resolve_alias(alias) {
            if owner == stream_id {
                return Ok(());
            }
            return Err(OverlayError::AlreadyExists(format!("alias {alias}")));
        }
        let entry = catalog
            .entry_mut(stream_id)
            .ok_or(OverlayError::NotFound)?;
        entry.alias = Some(alias.to_string());
        self.persist(&catalog).await?;
        debug!(stream = stream_id.get(), alias, "alias set");
        Ok(())
    }

    pub async fn resolve_alias(&self, alias: &str) -> Option<StreamId> {
        self.catalog.lock().await.resolve_alias(alias)
    }

    pub async fn remove_alias(&self, alias: &str) -> OverlayResult<()> {
        let mut catalog = self.catalog.lock().await;
        let stream_id = catalog.resolve_alias(alias).ok_or(OverlayError::NotFound)?;
        if let Some(entry) = catalog.entry_mut(stream_id) {
            entry.alias = None;
        }
        self.persist(&catalog).await?;
        debug!(stream = stream_id.get(), alias, "alias removed");
        Ok(())
    }

    pub async fn list_streams(&self) -> Vec<CatalogEntry> {
        self.catalog.lock().await.streams.clone()
    }

    pub fn quota_for(&self, stream_id: StreamId) -> Option<u64> {
        self.quotas.load().quota_for(stream_id)
    }

    pub fn quota_table(&self) -> Arc<QuotaTable> {
        self.quotas.load_full()
    }

    /// Replace the backup copy of a stream's dedicated log with its current
    /// content. Returns the number of records copied.
    pub async fn backup_stream(&self, stream_id: StreamId) -> OverlayResult<u64> {
        self.ensure_open()?;
        let backup = self
            .backup
            .as_ref()
            .ok_or_else(|| OverlayError::invalid_state("no backup container configured"))?;
        let catalog = self.catalog.lock().await;
        match catalog.entry(stream_id) {
            Some(entry) if entry.state == StreamState::Ready => {}
            _ => return Err(OverlayError::NotFound),
        }
        if let Some(stream) = self.open_handle(stream_id) {
            stream.flush().await?;
        }
        let source = self.dedicated.open_stream(stream_id).await?;
        match backup.delete_stream(stream_id).await {
            Ok(()) | Err(OverlayError::NotFound) => {}
            Err(err) => return Err(err),
        }
        let target = backup.create_stream(stream_id).await?;
        let copied = backup::copy_records(&source, &target).await?;
        drop(catalog);
        info!(stream = stream_id.get(), records = copied, "stream backed up");
        Ok(copied)
    }

    /// Read-only view of a stream's backup copy.
    pub async fn open_backup(&self, stream_id: StreamId) -> OverlayResult<BackupReader> {
        let backup = self
            .backup
            .as_ref()
            .ok_or_else(|| OverlayError::invalid_state("no backup container configured"))?;
        BackupReader::open(backup, stream_id, self.config.metadata_block_bytes).await
    }

    /// Close every open stream, then fail any remaining waiter with
    /// `Closing`. Returns the first stream close error.
    pub async fn close(&self) -> OverlayResult<()> {
        let streams: Vec<Arc<StreamOverlay>> =
            self.streams.lock().drain().map(|(_, stream)| stream).collect();
        let mut first_error = None;
        for stream in streams {
            if let Err(err) = stream.close().await {
                warn!(stream = stream.stream_id().get(), error = %err, "stream close failed");
                first_error.get_or_insert(err);
            }
        }
        self.allocator.close();
        self.shutdown.cancel();
        info!("log overlay closed");
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_open(&self) -> OverlayResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(OverlayError::Closing);
        }
        Ok(())
    }

    fn open_handle(&self, stream_id: StreamId) -> Option<Arc<StreamOverlay>> {
        self.streams
            .lock()
            .get(&stream_id)
            .filter(|stream| !stream.is_closed())
            .cloned()
    }

    fn stream_context(&self) -> StreamContext {
        StreamContext {
            config: Arc::clone(&self.config),
            allocator: self.allocator.clone(),
            quotas: Arc::clone(&self.quotas),
            shared_max_record_bytes: self
                .config
                .shared_max_record_bytes
                .min(self.shared.max_record_bytes()),
            shutdown: self.shutdown.child_token(),
        }
    }

    async fn persist(&self, catalog: &Catalog) -> OverlayResult<()> {
        self.shared.store_catalog(catalog.encode()?).await
    }

    fn recompute_quotas(&self, catalog: &Catalog) {
        let table = QuotaTable::compute(self.shared.capacity(), catalog.nominal_sizes());
        debug!(
            streams = table.len(),
            capacity = table.capacity(),
            oversubscribed = table.is_oversubscribed(),
            "shared quotas recomputed"
        );
        self.quotas.store(Arc::new(table));
    }

    /// Remove the open handle for `stream_id` and close it. A failed close
    /// is logged; the stream is going away regardless.
    async fn detach(&self, stream_id: StreamId) {
        let open = self.streams.lock().remove(&stream_id);
        if let Some(stream) = open {
            if let Err(err) = stream.close().await {
                warn!(
                    stream = stream_id.get(),
                    error = %err,
                    "closing detached stream failed"
                );
            }
        }
    }

    async fn purge_locked(&self, catalog: &mut Catalog, stream_id: StreamId) -> OverlayResult<()> {
        self.detach(stream_id).await;
        purge_physical(&self.shared, &self.dedicated, stream_id).await?;
        catalog.remove(stream_id);
        self.persist(catalog).await?;
        self.recompute_quotas(catalog);
        info!(stream = stream_id.get(), "stream purged");
        Ok(())
    }
}

async fn purge_physical(
    shared: &LogContainerHandle,
    dedicated: &LogContainerHandle,
    stream_id: StreamId,
) -> OverlayResult<()> {
    for container in [shared, dedicated] {
        match container.delete_stream(stream_id).await {
            Ok(()) | Err(OverlayError::NotFound) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Asn, Version};
    use crate::physical::{FaultPlan, MemoryLogContainer, PhysicalLogContainer};
    use crate::stream::WriteRequest;
    use crate::test_support::{MemoryContainers, fast_config, fill};
    use std::fmt;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{Layer, Registry};

    fn containers() -> (MemoryLogContainer, MemoryLogContainer) {
        (
            MemoryLogContainer::new(1 << 20, 1 << 20),
            MemoryLogContainer::unbounded(),
        )
    }

    async fn overlay(shared: &MemoryLogContainer, dedicated: &MemoryLogContainer) -> LogOverlay {
        LogOverlay::open(
            OverlayConfig::default(),
            Arc::new(shared.clone()),
            Arc::new(dedicated.clone()),
            None,
        )
        .await
        .expect("open overlay")
    }

    #[tokio::test]
    async fn quotas_follow_stream_set() {
        let (shared, dedicated) = containers();
        let overlay = overlay(&shared, &dedicated).await;
        let cap = 1u64 << 20;
        for id in 1..=4 {
            overlay
                .create_stream(StreamId::new(id), cap, None)
                .await
                .expect("create");
        }
        for id in 1..=4 {
            assert_eq!(overlay.quota_for(StreamId::new(id)), Some(cap / 4));
        }
        overlay.delete_stream(StreamId::new(4)).await.expect("delete");
        assert_eq!(overlay.quota_for(StreamId::new(4)), None);
        assert_eq!(overlay.quota_for(StreamId::new(1)), Some(cap / 3));
        assert!(!shared.contains_stream(StreamId::new(4)));
        assert!(!dedicated.contains_stream(StreamId::new(4)));
    }

    #[tokio::test]
    async fn aliases_are_unique() {
        let (shared, dedicated) = containers();
        let overlay = overlay(&shared, &dedicated).await;
        overlay
            .create_stream(StreamId::new(1), 100, Some("orders"))
            .await
            .expect("create");
        assert!(matches!(
            overlay.create_stream(StreamId::new(2), 100, Some("orders")).await,
            Err(OverlayError::AlreadyExists(_))
        ));
        overlay
            .create_stream(StreamId::new(2), 100, None)
            .await
            .expect("create second");
        assert!(matches!(
            overlay.set_alias(StreamId::new(2), "orders").await,
            Err(OverlayError::AlreadyExists(_))
        ));
        overlay.remove_alias("orders").await.expect("remove");
        overlay.set_alias(StreamId::new(2), "orders").await.expect("set");
        assert_eq!(overlay.resolve_alias("orders").await, Some(StreamId::new(2)));
        let stream = overlay.open_stream_by_alias("orders").await.expect("by alias");
        assert_eq!(stream.stream_id(), StreamId::new(2));
    }

    #[tokio::test]
    async fn duplicate_stream_is_rejected() {
        let (shared, dedicated) = containers();
        let overlay = overlay(&shared, &dedicated).await;
        overlay
            .create_stream(StreamId::new(1), 100, None)
            .await
            .expect("create");
        assert!(matches!(
            overlay.create_stream(StreamId::new(1), 100, None).await,
            Err(OverlayError::AlreadyExists(_))
        ));
        assert!(matches!(
            overlay.create_stream(StreamId::new(3), 0, None).await,
            Err(OverlayError::InvalidParameter(_))
        ));
        assert!(matches!(
            overlay.open_stream(StreamId::new(9)).await,
            Err(OverlayError::NotFound)
        ));
    }

    #[tokio::test]
    async fn catalog_survives_reopen() {
        let (shared, dedicated) = containers();
        {
            let overlay = overlay(&shared, &dedicated).await;
            overlay
                .create_stream(StreamId::new(5), 4096, Some("events"))
                .await
                .expect("create");
            overlay.close().await.expect("close");
        }
        let overlay = overlay(&shared, &dedicated).await;
        let entries = overlay.list_streams().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].alias.as_deref(), Some("events"));
        assert_eq!(entries[0].state, StreamState::Ready);
        overlay.open_stream(StreamId::new(5)).await.expect("reopen");
        assert_eq!(overlay.quota_for(StreamId::new(5)), Some(4096));
    }

    #[derive(Debug, Default)]
    struct CapturedEvent {
        message: String,
        stream: Option<u64>,
    }

    impl Visit for CapturedEvent {
        fn record_u64(&mut self, field: &Field, value: u64) {
            if field.name() == "stream" {
                self.stream = Some(value);
            }
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.message = format!("{value:?}");
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingLayer {
        events: Arc<Mutex<Vec<CapturedEvent>>>,
    }

    impl<S: Subscriber> Layer<S> for RecordingLayer {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut captured = CapturedEvent::default();
            event.record(&mut captured);
            self.events.lock().push(captured);
        }
    }

    #[tokio::test]
    async fn purge_at_open_is_logged() {
        let recorder = RecordingLayer::default();
        let _guard =
            tracing::subscriber::set_default(Registry::default().with(recorder.clone()));
        let (shared, dedicated) = containers();
        let mut catalog = Catalog::default();
        catalog.upsert(CatalogEntry {
            stream_id: StreamId::new(7),
            alias: None,
            nominal_size: 64,
            state: StreamState::Creating,
        });
        shared
            .store_catalog(catalog.encode().expect("encode"))
            .await
            .expect("store");

        let overlay = overlay(&shared, &dedicated).await;
        assert!(overlay.list_streams().await.is_empty());
        let events = recorder.events.lock();
        assert!(events.iter().any(|event| {
            event.message == "purging stream left partially provisioned"
                && event.stream == Some(7)
        }));
    }

    #[tokio::test]
    async fn failed_close_during_delete_is_logged() {
        let containers = MemoryContainers::default();
        let dedicated_plan = FaultPlan::new();
        let overlay = containers
            .open_faulty(fast_config(), FaultPlan::new(), Arc::clone(&dedicated_plan))
            .await
            .expect("overlay");
        let id = StreamId::new(11);
        let stream = overlay.create_stream(id, 1 << 20, None).await.expect("create");
        stream
            .write(WriteRequest::new(Asn::new(0), Version::new(1), fill(b'a', 4)))
            .await
            .expect("first");
        stream
            .write(WriteRequest::new(Asn::new(4), Version::new(2), fill(b'b', 4)))
            .await
            .expect("buffered");
        dedicated_plan.fail_writes_permanently(true);

        let recorder = RecordingLayer::default();
        let _guard =
            tracing::subscriber::set_default(Registry::default().with(recorder.clone()));
        overlay.delete_stream(id).await.expect("delete");

        assert!(stream.is_closed());
        assert!(!containers.dedicated.contains_stream(id));
        let events = recorder.events.lock();
        assert!(events.iter().any(|event| {
            event.message == "closing detached stream failed" && event.stream == Some(11)
        }));
    }

    #[tokio::test]
    async fn closed_overlay_rejects_requests() {
        let (shared, dedicated) = containers();
        let overlay = overlay(&shared, &dedicated).await;
        overlay.close().await.expect("close");
        assert!(matches!(
            overlay.create_stream(StreamId::new(1), 100, None).await,
            Err(OverlayError::Closing)
        ));
    }
}
