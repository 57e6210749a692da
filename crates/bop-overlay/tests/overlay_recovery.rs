use bop_overlay::overlay::{Catalog, CatalogEntry, StreamState};
use bop_overlay::test_support::{
    MemoryContainers, TEST_BLOCK_BYTES, fast_config, fill, memory_overlay, write_raw,
};
use bop_overlay::{
    Asn, BackupReader, OverlayError, PhysicalLogContainer, PhysicalLogStream, ReadType, StreamId,
    Version, WriteRequest, WriteRoute,
};

const NOMINAL: u64 = 1 << 20;

#[tokio::test]
async fn reopen_destages_shared_content() {
    let (overlay, containers) = memory_overlay(fast_config()).await.expect("overlay");
    let id = StreamId::new(1);
    let stream = overlay.create_stream(id, NOMINAL, None).await.expect("create");
    let mut expected = Vec::new();
    for (index, byte) in [b'a', b'b', b'c'].into_iter().enumerate() {
        let index = index as u64;
        let payload = fill(byte, 8);
        expected.extend_from_slice(&payload);
        let outcome = stream
            .write(WriteRequest::new(Asn::new(index * 8), Version::new(index + 1), payload))
            .await
            .expect("write");
        if index > 0 {
            assert_eq!(outcome.route, WriteRoute::SharedThenDestage);
        }
    }
    // Crash with two writes acknowledged only by the shared log.
    drop(stream);
    drop(overlay);

    let overlay = containers.open(fast_config()).await.expect("reopen");
    let stream = overlay.open_stream(id).await.expect("open");
    let recovered = stream.recovered();
    assert_eq!(recovered.destaged, 2);
    assert_eq!(recovered.tail, Some(Asn::new(24)));
    assert_eq!(recovered.high_version, Version::new(3));

    let dedicated = containers.dedicated_log(id).await.expect("dedicated");
    let layout: Vec<(u64, u64)> = dedicated
        .query_records(Asn::new(0), Asn::MAX)
        .await
        .expect("dedicated records")
        .iter()
        .map(|meta| (meta.asn.get(), meta.end().get()))
        .collect();
    assert_eq!(layout, vec![(0, 8), (8, 16), (16, 24)]);
    assert_eq!(
        containers
            .shared
            .stream(id)
            .expect("shared stream")
            .record_count(),
        0
    );

    let bytes = stream
        .multi_record_read(Asn::new(0), 64)
        .await
        .expect("read back");
    assert_eq!(&bytes[..], &expected[..]);

    // Writes resume after the recovered tail with a newer version.
    assert!(matches!(
        stream
            .write(WriteRequest::new(Asn::new(24), Version::new(3), fill(b'x', 4)))
            .await,
        Err(OverlayError::InvalidParameter(_))
    ));
    stream
        .write(WriteRequest::new(Asn::new(24), Version::new(4), fill(b'd', 4)))
        .await
        .expect("resume");
}

#[tokio::test]
async fn irreconcilable_gap_purges_stream() {
    let (overlay, containers) = memory_overlay(fast_config()).await.expect("overlay");
    let id = StreamId::new(2);
    overlay
        .create_stream(id, NOMINAL, Some("broken"))
        .await
        .expect("create");
    overlay.close().await.expect("close");

    let shared = containers.shared_log(id).await.expect("shared");
    let dedicated = containers.dedicated_log(id).await.expect("dedicated");
    write_raw(&dedicated, 0, 1, b"aaaa", TEST_BLOCK_BYTES)
        .await
        .expect("dedicated record");
    write_raw(&shared, 8, 2, b"cccc", TEST_BLOCK_BYTES)
        .await
        .expect("shared record");

    let overlay = containers.open(fast_config()).await.expect("reopen");
    assert!(matches!(
        overlay.open_stream(id).await,
        Err(OverlayError::StructureFault { .. })
    ));
    assert!(!containers.shared.contains_stream(id));
    assert!(!containers.dedicated.contains_stream(id));
    assert_eq!(overlay.resolve_alias("broken").await, None);
    assert!(overlay.list_streams().await.is_empty());
    assert_eq!(overlay.quota_for(id), None);
    assert!(matches!(
        overlay.open_stream(id).await,
        Err(OverlayError::NotFound)
    ));
}

#[tokio::test]
async fn interrupted_provisioning_is_purged_at_open() {
    let containers = MemoryContainers::default();
    let creating = StreamId::new(3);
    let deleting = StreamId::new(4);
    let orphan = StreamId::new(9);
    let mut catalog = Catalog::default();
    catalog.upsert(CatalogEntry {
        stream_id: creating,
        alias: Some("half-made".to_string()),
        nominal_size: NOMINAL,
        state: StreamState::Creating,
    });
    catalog.upsert(CatalogEntry {
        stream_id: deleting,
        alias: None,
        nominal_size: NOMINAL,
        state: StreamState::Deleting,
    });
    containers
        .shared
        .store_catalog(catalog.encode().expect("encode"))
        .await
        .expect("store catalog");
    containers
        .shared
        .create_stream(creating)
        .await
        .expect("partial shared stream");
    containers
        .dedicated
        .create_stream(deleting)
        .await
        .expect("partial dedicated stream");
    containers
        .dedicated
        .create_stream(orphan)
        .await
        .expect("orphan stream");

    let overlay = containers.open(fast_config()).await.expect("open");
    assert!(overlay.list_streams().await.is_empty());
    for id in [creating, deleting, orphan] {
        assert!(!containers.shared.contains_stream(id));
        assert!(!containers.dedicated.contains_stream(id));
        assert!(matches!(
            overlay.open_stream(id).await,
            Err(OverlayError::NotFound)
        ));
    }
    assert_eq!(overlay.resolve_alias("half-made").await, None);
    assert!(overlay.quota_table().is_empty());

    let persisted = Catalog::decode(
        &containers
            .shared
            .load_catalog()
            .await
            .expect("catalog after purge"),
    )
    .expect("decode");
    assert!(persisted.streams.is_empty());
}

#[tokio::test]
async fn corrupted_container_fails_open_and_backup_still_reads() {
    let (overlay, containers) = memory_overlay(fast_config()).await.expect("overlay");
    let id = StreamId::new(5);
    let stream = overlay.create_stream(id, NOMINAL, None).await.expect("create");
    for (index, byte) in [b'x', b'y', b'z'].into_iter().enumerate() {
        let index = index as u64;
        stream
            .write(WriteRequest::new(
                Asn::new(index * 8),
                Version::new(index + 1),
                fill(byte, 8),
            ))
            .await
            .expect("write");
    }
    let copied = overlay.backup_stream(id).await.expect("backup");
    assert_eq!(copied, 2);
    overlay.close().await.expect("close");

    containers
        .shared
        .set_corrupted(Some("superblock checksum mismatch".to_string()));
    assert!(matches!(
        containers.open(fast_config()).await,
        Err(OverlayError::ContainerCorrupted(_))
    ));

    let reader = BackupReader::open(&containers.backup_handle(), id, TEST_BLOCK_BYTES)
        .await
        .expect("backup reader");
    let bytes = reader
        .multi_record_read(Asn::new(0), 64)
        .await
        .expect("backup read");
    assert_eq!(&bytes[..], b"xxxxxxxxyyyyyyyyzzzzzzzz");
    let middle = reader
        .read(Asn::new(12), ReadType::Exact)
        .await
        .expect("exact inside coalesced record");
    assert_eq!(&middle.data[..], b"yyyyzzzzzzzz");
    assert_eq!(
        reader.read(Asn::new(24), ReadType::Exact).await,
        Err(OverlayError::NotFound)
    );
    let range = reader.query_record_range().await.expect("range");
    assert_eq!(range.high, Asn::new(8));
}

#[tokio::test]
async fn deleted_stream_leaves_nothing_behind() {
    let (overlay, containers) = memory_overlay(fast_config()).await.expect("overlay");
    let id = StreamId::new(6);
    let stream = overlay
        .create_stream(id, NOMINAL, Some("gone"))
        .await
        .expect("create");
    stream
        .write(WriteRequest::new(Asn::new(0), Version::new(1), fill(b'g', 8)))
        .await
        .expect("write");
    overlay.backup_stream(id).await.expect("backup");
    overlay.delete_stream(id).await.expect("delete");

    assert!(stream.is_closed());
    assert!(!containers.shared.contains_stream(id));
    assert!(!containers.dedicated.contains_stream(id));
    assert!(!containers.backup.contains_stream(id));
    assert_eq!(overlay.resolve_alias("gone").await, None);
    assert!(matches!(
        overlay.delete_stream(id).await,
        Err(OverlayError::NotFound)
    ));

    let reopened = containers.open(fast_config()).await.expect("reopen");
    assert!(reopened.list_streams().await.is_empty());
}
