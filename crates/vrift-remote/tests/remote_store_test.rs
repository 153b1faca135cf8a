use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use vrift_cas::{Blob, Digest, EntryType, FaultKind, EMPTY_DIGEST};
use vrift_config::RemoteConfig;
use vrift_remote::{Code, MemoryCas, RemoteError, RemoteStore};

fn config() -> RemoteConfig {
    RemoteConfig {
        enabled: true,
        max_batch_total_bytes: 1000,
        chunk_size: 256,
        retries: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        request_timeout_ms: 2_000,
        ..RemoteConfig::default()
    }
}

fn client(cas: &Arc<MemoryCas>, config: &RemoteConfig) -> RemoteStore {
    RemoteStore::new(cas.clone(), config)
}

fn blob(bytes: &[u8]) -> (Digest, Blob) {
    (Digest::of_bytes(bytes), Blob::from(Bytes::copy_from_slice(bytes)))
}

#[tokio::test]
async fn find_missing_returns_exactly_the_absent_subset() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    let a = cas.insert(&b"present a"[..]);
    let b = cas.insert(&b"present b"[..]);
    let c = Digest::of_bytes(b"absent c");
    let d = Digest::of_bytes(b"absent d");

    let missing = remote.find_missing([a, b, c, d, EMPTY_DIGEST]).await.unwrap();
    assert_eq!(missing, HashSet::from([c, d]));

    let none = remote.find_missing(Vec::new()).await.unwrap();
    assert!(none.is_empty());
    assert_eq!(cas.calls().find_missing, 1);
}

#[tokio::test]
async fn find_missing_partitions_at_digest_cap() {
    let cas = Arc::new(MemoryCas::new().with_max_digests(3));
    let remote = client(
        &cas,
        &RemoteConfig {
            max_batch_digests: 3,
            ..config()
        },
    );
    let present: Vec<_> = (0..4u8).map(|i| cas.insert(vec![i; 10])).collect();
    let absent: Vec<_> = (0..6u8).map(|i| Digest::of_bytes(&[i; 20])).collect();

    let query = present.iter().chain(absent.iter()).copied();
    let missing = remote.find_missing(query).await.unwrap();
    assert_eq!(missing, absent.into_iter().collect::<HashSet<_>>());
    assert_eq!(cas.calls().find_missing, 4);
}

#[tokio::test]
async fn failing_partition_fails_whole_call() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(
        &cas,
        &RemoteConfig {
            max_batch_digests: 2,
            ..config()
        },
    );
    cas.fail_next(1, Code::PermissionDenied);
    let query: Vec<_> = (0..6u8).map(|i| Digest::of_bytes(&[i])).collect();

    let err = remote.find_missing(query).await.unwrap_err();
    assert!(matches!(err, RemoteError::Rejected { .. }));
    assert_eq!(err.kind(), FaultKind::RemoteRejected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loads_share_one_fetch() {
    for size in [100usize, 50_000] {
        let cas = Arc::new(MemoryCas::new().with_latency(Duration::from_millis(50)));
        let remote = client(&cas, &config());
        let content: Vec<u8> = (0..size).map(|i| (i % 97) as u8).collect();
        let digest = cas.insert(content.clone());

        let loads: Vec<_> = (0..10)
            .map(|_| {
                let remote = remote.clone();
                tokio::spawn(async move { remote.load(EntryType::File, digest).await })
            })
            .collect();

        for load in loads {
            let bytes = load.await.unwrap().unwrap().unwrap();
            assert_eq!(&bytes[..], &content[..]);
        }
        assert_eq!(cas.calls().fetches(), 1, "size {}", size);
    }
}

#[tokio::test]
async fn sequential_loads_fetch_again() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    let digest = cas.insert(&b"twice"[..]);

    remote.load(EntryType::File, digest).await.unwrap();
    remote.load(EntryType::File, digest).await.unwrap();
    assert_eq!(cas.calls().fetches(), 2);
}

#[tokio::test]
async fn absent_is_none_but_unreachable_is_error() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    let small = Digest::of_bytes(b"nowhere");
    let large = Digest::of_bytes(&[9u8; 5000]);

    assert!(remote.load(EntryType::File, small).await.unwrap().is_none());
    assert!(remote.load(EntryType::File, large).await.unwrap().is_none());
    assert_eq!(cas.calls().read_stream, 1);

    cas.fail_next(usize::MAX, Code::Unavailable);
    let err = remote.load(EntryType::File, small).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::RemoteUnavailable);
    assert!(matches!(err, RemoteError::Unavailable { attempts: 4, .. }));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    let digest = cas.insert(&b"eventually"[..]);
    cas.fail_next(2, Code::Unavailable);

    let bytes = remote.load(EntryType::File, digest).await.unwrap().unwrap();
    assert_eq!(&bytes[..], b"eventually");
    assert_eq!(cas.calls().batch_read, 3);
}

#[tokio::test]
async fn timeouts_are_retried_then_unavailable() {
    let cas = Arc::new(MemoryCas::new().with_latency(Duration::from_millis(200)));
    let remote = client(
        &cas,
        &RemoteConfig {
            retries: 1,
            request_timeout_ms: 20,
            ..config()
        },
    );
    let digest = cas.insert(&b"slow"[..]);

    let err = remote.load(EntryType::File, digest).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::RemoteUnavailable);
    assert_eq!(cas.calls().batch_read, 2);
}

#[tokio::test]
async fn corrupt_remote_content_is_integrity_fault() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    let digest = Digest::of_bytes(b"expected");
    cas.insert_corrupt(digest, &b"tampered"[..]);

    let err = remote.load(EntryType::File, digest).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::IntegrityFault);
    // Not retried
    assert_eq!(cas.calls().batch_read, 1);
}

#[tokio::test]
async fn upload_batches_small_and_streams_large() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());

    let mut blobs: Vec<_> = (0..5u8).map(|i| blob(&[i; 400])).collect();
    blobs.push(blob(&[7u8; 5000]));
    let digests: Vec<_> = blobs.iter().map(|(d, _)| *d).collect();

    let report = remote.upload_all(EntryType::File, blobs).await.unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.batched_blobs, 5);
    assert_eq!(report.streamed_blobs, 1);
    assert_eq!(report.bytes, 5 * 400 + 5000);

    for d in &digests {
        assert!(cas.contains(d));
    }
    let calls = cas.calls();
    assert_eq!(calls.batch_update, 3);
    assert_eq!(calls.write_stream, 1);
}

#[tokio::test]
async fn misreported_commit_size_is_integrity_fault() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    cas.misreport_commits(true);
    let (digest, content) = blob(&[3u8; 4000]);

    let err = remote.upload(EntryType::File, digest, content).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::IntegrityFault);
    assert_eq!(cas.calls().write_stream, 1);
}

#[tokio::test]
async fn source_length_mismatch_is_rejected_before_sending() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    let digest = Digest::of_bytes(b"declared");

    let err = remote
        .upload(EntryType::File, digest, Blob::from(Bytes::from_static(b"short")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::IntegrityFault);
    assert_eq!(cas.calls().uploads(), 0);
}

#[tokio::test]
async fn connect_adopts_smaller_advertised_cap() {
    let cas = Arc::new(MemoryCas::new().with_batch_cap(500));
    let remote = RemoteStore::connect(cas.clone(), &config()).await.unwrap();
    assert_eq!(remote.limits().max_batch_bytes, 500);

    // 600 bytes no longer fits a batch
    let (digest, content) = blob(&[1u8; 600]);
    let report = remote.upload(EntryType::File, digest, content).await.unwrap();
    assert_eq!(report.streamed_blobs, 1);

    let roomy = Arc::new(MemoryCas::new().with_batch_cap(1 << 30));
    let remote = RemoteStore::connect(roomy, &config()).await.unwrap();
    assert_eq!(remote.limits().max_batch_bytes, 1000);
}

#[tokio::test]
async fn open_stream_yields_content_in_chunks() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    let content = vec![4u8; 150_000];
    let digest = cas.insert(content.clone());

    use futures::TryStreamExt;
    let stream = remote.open_stream(digest).await.unwrap().unwrap();
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    assert!(chunks.len() > 1);
    assert_eq!(chunks.concat(), content);

    let absent = Digest::of_bytes(&[0u8; 2000]);
    assert!(remote.open_stream(absent).await.unwrap().is_none());
}

#[tokio::test]
async fn streamed_load_restarts_after_connection_reset() {
    let cas = Arc::new(MemoryCas::new().with_read_chunk(1000));
    let remote = client(&cas, &config());
    let content: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
    let digest = cas.insert(content.clone());
    cas.reset_streams(1, 2);

    let bytes = remote.load(EntryType::File, digest).await.unwrap().unwrap();
    assert_eq!(&bytes[..], &content[..]);
    assert_eq!(cas.calls().read_stream, 2);
}

#[tokio::test]
async fn repeated_resets_exhaust_retries() {
    let cas = Arc::new(MemoryCas::new().with_read_chunk(1000));
    let remote = client(&cas, &config());
    let digest = cas.insert(vec![5u8; 5000]);
    cas.reset_streams(usize::MAX, 1);

    let err = remote.load(EntryType::File, digest).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::RemoteUnavailable);
    assert!(matches!(err, RemoteError::Unavailable { attempts: 4, .. }));
    assert_eq!(cas.calls().read_stream, 4);
}

#[tokio::test]
async fn stalled_stream_times_out_and_is_retried() {
    let cas = Arc::new(MemoryCas::new().with_read_chunk(1000));
    let remote = client(
        &cas,
        &RemoteConfig {
            request_timeout_ms: 100,
            ..config()
        },
    );
    let content = vec![6u8; 5000];
    let digest = cas.insert(content.clone());
    cas.stall_streams(1, 1);

    let loaded = tokio::time::timeout(Duration::from_secs(5), remote.load(EntryType::File, digest))
        .await
        .expect("stalled stream must time out");
    assert_eq!(&loaded.unwrap().unwrap()[..], &content[..]);
    assert_eq!(cas.calls().read_stream, 2);

    // Stalling forever ends as unavailable, not as a hang
    let stuck = cas.insert(vec![7u8; 5000]);
    cas.stall_streams(usize::MAX, 1);
    let err = tokio::time::timeout(Duration::from_secs(5), remote.load(EntryType::File, stuck))
        .await
        .expect("stalled stream must time out")
        .unwrap_err();
    match err {
        RemoteError::Unavailable { last, .. } => assert_eq!(last.code, Code::DeadlineExceeded),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn unacknowledged_batch_upload_fails() {
    let cas = Arc::new(MemoryCas::new());
    let remote = client(&cas, &config());
    cas.drop_batch_acks(true);
    let (digest, content) = blob(b"never acknowledged");

    let err = remote.upload(EntryType::File, digest, content).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::RemoteUnavailable);
    assert!(!cas.contains(&digest));
    assert_eq!(cas.calls().batch_update, 4);

    // Acknowledged once the service answers again
    cas.drop_batch_acks(false);
    let (digest, content) = blob(b"acknowledged");
    let report = remote.upload(EntryType::File, digest, content).await.unwrap();
    assert_eq!(report.batched_blobs, 1);
    assert!(cas.contains(&digest));
}
