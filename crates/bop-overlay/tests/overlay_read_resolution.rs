use std::sync::Arc;

use bop_overlay::test_support::{
    MemoryContainers, TEST_BLOCK_BYTES, fast_config, fill, memory_overlay, write_raw,
};
use bop_overlay::{
    Asn, FaultPlan, LogStreamHandle, OverlayError, ReadType, RecordSource, StreamId,
    StreamOverlay, Version, WriteRequest,
};

const NOMINAL: u64 = 1 << 20;

async fn inject(log: &LogStreamHandle, byte: u8, version: u64) {
    for index in 0..10u64 {
        write_raw(log, index * 10, version, &fill(byte, 10), TEST_BLOCK_BYTES)
            .await
            .expect("inject");
    }
}

async fn assert_all_read_types(stream: &StreamOverlay, expected: u8, source: RecordSource) {
    let cases = [
        (ReadType::Exact, 20, 20),
        (ReadType::Next, 20, 30),
        (ReadType::Previous, 20, 10),
        (ReadType::Containing, 25, 20),
    ];
    for (read_type, asn, landed) in cases {
        let record = stream
            .read(Asn::new(asn), read_type)
            .await
            .unwrap_or_else(|err| panic!("{read_type:?} at {asn}: {err}"));
        assert_eq!(record.asn, Asn::new(landed), "{read_type:?}");
        assert_eq!(record.source, source, "{read_type:?}");
        assert_eq!(record.data.len(), 10);
        assert!(
            record.data.iter().all(|byte| *byte == expected),
            "{read_type:?} returned mixed content"
        );
    }
}

#[tokio::test]
async fn equal_versions_resolve_to_dedicated() {
    let (overlay, containers) = memory_overlay(fast_config()).await.expect("overlay");
    let id = StreamId::new(1);
    let stream = overlay.create_stream(id, NOMINAL, None).await.expect("create");
    inject(&containers.shared_log(id).await.expect("shared"), b'S', 1).await;
    inject(&containers.dedicated_log(id).await.expect("dedicated"), b'D', 1).await;

    assert_all_read_types(&stream, b'D', RecordSource::Dedicated).await;
}

#[tokio::test]
async fn newer_shared_versions_win() {
    let (overlay, containers) = memory_overlay(fast_config()).await.expect("overlay");
    let id = StreamId::new(2);
    let stream = overlay.create_stream(id, NOMINAL, None).await.expect("create");
    inject(&containers.shared_log(id).await.expect("shared"), b'S', 100).await;
    inject(&containers.dedicated_log(id).await.expect("dedicated"), b'D', 10).await;

    assert_all_read_types(&stream, b'S', RecordSource::Shared).await;
    let record = stream
        .read(Asn::new(40), ReadType::Exact)
        .await
        .expect("read");
    assert_eq!(record.version, Version::new(100));
    assert_eq!(stream.metrics().reads_from_shared, 5);
}

#[tokio::test]
async fn vanished_shared_winner_falls_back_to_dedicated() {
    let containers = MemoryContainers::default();
    let shared_plan = FaultPlan::new();
    let dedicated_plan = FaultPlan::new();
    let overlay = containers
        .open_faulty(fast_config(), Arc::clone(&shared_plan), Arc::clone(&dedicated_plan))
        .await
        .expect("overlay");
    let id = StreamId::new(3);
    let stream = overlay.create_stream(id, NOMINAL, None).await.expect("create");
    let shared = containers.shared_log(id).await.expect("shared");
    let dedicated = containers.dedicated_log(id).await.expect("dedicated");
    write_raw(&shared, 0, 100, b"SSSSSSSS", TEST_BLOCK_BYTES)
        .await
        .expect("shared record");
    write_raw(&dedicated, 0, 10, b"DDDDDDDD", TEST_BLOCK_BYTES)
        .await
        .expect("dedicated record");

    shared_plan.lose_queries(1);
    let fallback = stream
        .read(Asn::new(0), ReadType::Exact)
        .await
        .expect("fallback read");
    assert_eq!(&fallback.data[..], b"DDDDDDDD");
    assert_eq!(fallback.source, RecordSource::Dedicated);

    let settled = stream
        .read(Asn::new(0), ReadType::Exact)
        .await
        .expect("settled read");
    assert_eq!(&settled.data[..], b"SSSSSSSS");

    shared_plan.lose_queries(1);
    dedicated_plan.lose_queries(1);
    assert_eq!(
        stream.read(Asn::new(0), ReadType::Exact).await,
        Err(OverlayError::NotFound)
    );
}

#[tokio::test]
async fn multi_record_read_is_stable_across_flush() {
    let (overlay, containers) = memory_overlay(fast_config()).await.expect("overlay");
    let id = StreamId::new(4);
    let stream = overlay.create_stream(id, NOMINAL, None).await.expect("create");
    let mut expected = Vec::new();
    for index in 0..5u64 {
        let payload = fill(b'a' + index as u8, 6);
        expected.extend_from_slice(&payload);
        stream
            .write(WriteRequest::new(
                Asn::new(index * 6),
                Version::new(index + 1),
                payload,
            ))
            .await
            .expect("write");
    }

    let listed = stream
        .query_records(Asn::new(0), Asn::MAX)
        .await
        .expect("query");
    assert!(
        listed
            .iter()
            .any(|meta| meta.debug_info.starts_with("buffer"))
    );

    let before = stream
        .multi_record_read(Asn::new(0), 4096)
        .await
        .expect("read buffered");
    assert_eq!(&before[..], &expected[..]);

    stream.flush().await.expect("flush");
    let after = stream
        .multi_record_read(Asn::new(0), 4096)
        .await
        .expect("read flushed");
    assert_eq!(before, after);

    let clipped = stream
        .multi_record_read(Asn::new(3), 10)
        .await
        .expect("clipped");
    assert_eq!(&clipped[..], &expected[3..13]);
    assert!(matches!(
        stream.multi_record_read(Asn::new(0), 0).await,
        Err(OverlayError::InvalidParameter(_))
    ));

    overlay.close().await.expect("close");
    assert_eq!(
        containers
            .dedicated
            .stream(id)
            .expect("dedicated stream")
            .record_count(),
        2
    );
}

#[tokio::test]
async fn tail_overwrite_never_mixes_old_bytes() {
    let (overlay, _containers) = memory_overlay(fast_config()).await.expect("overlay");
    let stream = overlay
        .create_stream(StreamId::new(5), NOMINAL, None)
        .await
        .expect("create");
    for (index, byte) in [b'a', b'b', b'c'].into_iter().enumerate() {
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
    stream
        .write(WriteRequest::new(Asn::new(4), Version::new(4), fill(b'Z', 8)))
        .await
        .expect("overwrite");
    assert_eq!(stream.tail(), Some(Asn::new(12)));

    for flushed in [false, true] {
        if flushed {
            stream.flush().await.expect("flush");
        }
        for asn in 4..12u64 {
            let record = stream
                .read(Asn::new(asn), ReadType::Exact)
                .await
                .expect("overwritten range");
            assert_eq!(record.version, Version::new(4));
            assert!(record.data.iter().all(|byte| *byte == b'Z'));
        }
        for asn in 12..24u64 {
            assert_eq!(
                stream.read(Asn::new(asn), ReadType::Exact).await,
                Err(OverlayError::NotFound),
                "stale byte at {asn}"
            );
        }
        let whole = stream
            .multi_record_read(Asn::new(0), 64)
            .await
            .expect("whole");
        assert_eq!(&whole[..], b"aaaaZZZZZZZZ");
    }
}

#[tokio::test]
async fn repeated_exact_reads_are_identical() {
    let (overlay, _containers) = memory_overlay(fast_config()).await.expect("overlay");
    let stream = overlay
        .create_stream(StreamId::new(6), NOMINAL, None)
        .await
        .expect("create");
    for index in 0..4u64 {
        stream
            .write(
                WriteRequest::new(Asn::new(index * 16), Version::new(index + 1), fill(b'q', 16))
                    .with_metadata(format!("m{index}").into_bytes()),
            )
            .await
            .expect("write");
    }
    for asn in [0u64, 5, 16, 33, 63] {
        let first = stream
            .read(Asn::new(asn), ReadType::Exact)
            .await
            .expect("first");
        let second = stream
            .read(Asn::new(asn), ReadType::Exact)
            .await
            .expect("second");
        assert_eq!((first.version, &first.data), (second.version, &second.data));
        assert_eq!(first.asn, Asn::new(asn));
    }
    assert_eq!(
        stream.read(Asn::new(64), ReadType::Exact).await,
        Err(OverlayError::NotFound)
    );
    let range = stream.query_record_range().await.expect("range");
    assert_eq!(range.low, Asn::new(0));
}
