use std::fs;
use std::sync::Arc;
use std::thread;

use vrift_cas::{CasError, Digest, EntryType, FaultKind, LocalStore, EMPTY_DIGEST};
use vrift_config::testing::{TestEnvironment, TEST_LARGE_BLOB_THRESHOLD};

fn open(env: &TestEnvironment) -> LocalStore {
    LocalStore::open(&env.config()).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn round_trip_across_threshold_boundary() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env);
    let t = TEST_LARGE_BLOB_THRESHOLD as usize;

    for (seed, len) in [0, 1, t - 1, t, t + 1, 10 * t].into_iter().enumerate() {
        for kind in EntryType::ALL {
            let data = pattern(len, seed as u8);
            let digest = store.store(kind, &data).unwrap();
            assert_eq!(digest, Digest::of_bytes(&data));

            let loaded = store.load(kind, &digest).unwrap().unwrap();
            assert_eq!(&loaded[..], &data[..], "len {} in {}", len, kind);
            assert!(store.exists(kind, &digest).unwrap());
        }
    }
}

#[test]
fn large_blobs_are_memory_mapped() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env);
    let data = pattern(TEST_LARGE_BLOB_THRESHOLD as usize * 4, 9);
    let digest = store.store(EntryType::File, &data).unwrap();

    let blob = store.load(EntryType::File, &digest).unwrap().unwrap();
    assert!(blob.is_mapped());

    let small = store.store(EntryType::File, b"tiny").unwrap();
    assert!(!store.load(EntryType::File, &small).unwrap().unwrap().is_mapped());
}

#[test]
fn buffered_reads_when_mmap_disabled() {
    let env = TestEnvironment::new().unwrap();
    let mut config = env.config();
    config.local.use_mmap = false;
    let store = LocalStore::open(&config).unwrap();

    let data = pattern(5000, 3);
    let digest = store.store(EntryType::File, &data).unwrap();
    let blob = store.load(EntryType::File, &digest).unwrap().unwrap();
    assert!(!blob.is_mapped());
    assert_eq!(&blob[..], &data[..]);
}

#[test]
fn absent_digest_loads_as_none() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env);
    let small = Digest::of_bytes(b"never stored");
    let large = Digest::of_bytes(&pattern(8192, 1));

    assert!(store.load(EntryType::File, &small).unwrap().is_none());
    assert!(store.load(EntryType::File, &large).unwrap().is_none());
    assert!(!store.exists(EntryType::File, &small).unwrap());
    assert!(store.exists(EntryType::File, &EMPTY_DIGEST).unwrap());
}

#[test]
fn namespaces_do_not_alias() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env);
    let digest = store.store(EntryType::Directory, b"listing").unwrap();

    assert!(store.exists(EntryType::Directory, &digest).unwrap());
    assert!(!store.exists(EntryType::File, &digest).unwrap());
    assert!(store.load(EntryType::File, &digest).unwrap().is_none());
}

#[test]
fn concurrent_identical_stores_write_once() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(open(&env));

    for data in [pattern(100, 1), pattern(50_000, 2)] {
        let data = Arc::new(data);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let data = Arc::clone(&data);
                thread::spawn(move || store.store(EntryType::File, &data).unwrap())
            })
            .collect();

        let digests: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(&store.load(EntryType::File, &digests[0]).unwrap().unwrap()[..], &data[..]);
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.small_blobs, 1);
    assert_eq!(stats.large_blobs, 1);

    let staging = env.store_root.join("large").join(".staging");
    assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
}

#[test]
fn corrupted_large_file_is_integrity_fault() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env);
    let data = pattern(20_000, 4);
    let digest = store.store(EntryType::File, &data).unwrap();

    let path = store.large_blob_path(EntryType::File, &digest);
    let mut bytes = fs::read(&path).unwrap();
    bytes[10_000] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let err = store.load(EntryType::File, &digest).unwrap_err();
    assert!(matches!(err, CasError::HashMismatch { .. }));
    assert_eq!(err.kind(), FaultKind::IntegrityFault);
}

#[test]
fn truncated_large_file_is_integrity_fault() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env);
    let digest = store.store(EntryType::File, &pattern(20_000, 5)).unwrap();

    let path = store.large_blob_path(EntryType::File, &digest);
    fs::write(&path, &pattern(100, 5)).unwrap();

    let err = store.load(EntryType::File, &digest).unwrap_err();
    assert_eq!(err.kind(), FaultKind::IntegrityFault);
}

/// "A" is small and lives in its shard; 10 MB of zeros is large and lives in
/// the file tree. With the file deleted out of band the lease record still
/// claims presence, so the load is a storage fault rather than a miss.
#[test]
fn deleted_large_file_with_live_record_is_storage_fault() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env);

    let d1 = store.store(EntryType::File, b"A").unwrap();
    let d2 = store.store(EntryType::File, &vec![0u8; 10 * 1024 * 1024]).unwrap();
    assert!(store.exists(EntryType::File, &d1).unwrap());
    assert!(store.exists(EntryType::File, &d2).unwrap());
    assert!(!store.is_large(d1.size));
    assert!(store.is_large(d2.size));

    let path = store.large_blob_path(EntryType::File, &d2);
    fs::remove_file(&path).unwrap();

    let err = store.load(EntryType::File, &d2).unwrap_err();
    assert_eq!(err.kind(), FaultKind::StorageFault);
    match err {
        CasError::MissingBlob {
            digest,
            shard,
            path: missing,
            ..
        } => {
            assert_eq!(digest, d2);
            assert_eq!(shard, store.shard_of(&d2));
            assert_eq!(missing, path);
        }
        other => panic!("expected MissingBlob, got {:?}", other),
    }

    // The small entry is unaffected
    assert_eq!(&store.load(EntryType::File, &d1).unwrap().unwrap()[..], b"A");
}

#[test]
fn contents_survive_reopen() {
    let env = TestEnvironment::new().unwrap();
    let small;
    let large;
    {
        let store = open(&env);
        small = store.store(EntryType::Directory, b"persisted").unwrap();
        large = store.store(EntryType::File, &pattern(4096, 6)).unwrap();
        store.shutdown().unwrap();
    }

    let store = open(&env);
    assert_eq!(&store.load(EntryType::Directory, &small).unwrap().unwrap()[..], b"persisted");
    assert_eq!(store.load(EntryType::File, &large).unwrap().unwrap().len(), 4096);
    assert_eq!(store.list_digests(EntryType::File).count(), 1);
}

#[test]
fn invalid_config_is_rejected() {
    let env = TestEnvironment::new().unwrap();
    let mut config = env.config();
    config.local.shard_count = 0;

    let err = LocalStore::open(&config).unwrap_err();
    assert_eq!(err.kind(), FaultKind::InvariantViolation);
}
