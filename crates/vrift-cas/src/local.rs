//! The local store: small blobs inline in the shard databases, large blobs as
//! digest-addressed files, one lease record per digest either way.
//!
//! A digest is routed by size alone: `size < large_blob_threshold` is small,
//! anything else is large. The empty digest is never stored.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;
use tracing::instrument;

use vrift_config::{log_local_debug, log_local_warn, Config};

use crate::blob::Blob;
use crate::digest::{Digest, DigestHasher, EntryType, EMPTY_DIGEST};
use crate::large::LargeBlobs;
use crate::lease::{now_micros, to_micros};
use crate::sharded_lmdb::ShardedLmdb;
use crate::{CasError, Result};

/// Read buffer for streaming ingest.
const INGEST_CHUNK: usize = 64 * 1024;

/// Handle to the local store. Cheap to clone; clones share every shard.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pub(crate) db: ShardedLmdb,
    pub(crate) large: LargeBlobs,
    root: PathBuf,
    threshold: u64,
    use_mmap: bool,
    pub(crate) retention: Duration,
}

impl LocalStore {
    /// Open (or create) the store rooted at `config.local.root`.
    pub fn open(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CasError::Config(e.to_string()))?;

        let root = config.local.resolved_root();
        fs::create_dir_all(&root).map_err(CasError::io(&root))?;

        let db = ShardedLmdb::open(
            root.join("lmdb"),
            config.local.shard_count,
            config.local.shard_map_size,
        )?;
        let large = LargeBlobs::open(root.join("large"))?;

        log_local_debug!(
            "Opened local store",
            root = root.display(),
            shards = config.local.shard_count,
            large_blob_threshold = config.local.large_blob_threshold
        );

        Ok(Self {
            db,
            large,
            root,
            threshold: config.local.large_blob_threshold,
            use_mmap: config.local.use_mmap,
            retention: Duration::from_secs(config.gc.lease_retention_secs),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn large_blob_threshold(&self) -> u64 {
        self.threshold
    }

    /// Whether content of `size` bytes lives in the large-blob tree.
    #[inline]
    pub fn is_large(&self, size: u64) -> bool {
        size >= self.threshold
    }

    /// Store `bytes`, returning their digest.
    ///
    /// Idempotent: storing content that is already present only refreshes
    /// its lease.
    #[instrument(skip(self, bytes), fields(len = bytes.len()), level = "debug")]
    pub fn store(&self, kind: EntryType, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(bytes);
        if digest.is_empty() {
            return Ok(digest);
        }
        let now = now_micros();

        if !self.is_large(digest.size) {
            self.db.put_if_absent(kind, &digest, bytes, now)?;
            return Ok(digest);
        }

        if self.db.touch(kind, &digest, now)?.is_some() && self.large.contains(kind, &digest) {
            return Ok(digest);
        }
        let staged = self.large.stage_bytes(bytes)?;
        self.insert_large(kind, &digest, staged)?;
        Ok(digest)
    }

    /// Store the contents of a file without reading it into memory whole.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()), level = "debug")]
    pub fn store_file<P: AsRef<Path>>(&self, kind: EntryType, path: P) -> Result<Digest> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(CasError::io(path))?;
        let len = file.metadata().map_err(CasError::io(path))?.len();

        if !self.is_large(len) {
            let mut data = Vec::with_capacity(len as usize);
            file.read_to_end(&mut data).map_err(CasError::io(path))?;
            return self.store(kind, &data);
        }

        let mut writer = self.large_writer(kind, None)?;
        let mut buf = vec![0u8; INGEST_CHUNK];
        loop {
            let n = file.read(&mut buf).map_err(CasError::io(path))?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&buf[..n])?;
        }
        writer.commit()
    }

    /// Start a chunked write. With `expected` set, `commit` fails unless the
    /// written bytes hash to exactly that digest.
    pub fn large_writer(&self, kind: EntryType, expected: Option<Digest>) -> Result<LargeBlobWriter> {
        let staged = self.large.stage()?;
        Ok(LargeBlobWriter {
            store: self.clone(),
            kind,
            expected,
            file: BufWriter::new(staged),
            hasher: DigestHasher::new(),
            written: 0,
        })
    }

    /// Record a staged large blob. The rename happens inside the shard
    /// transaction, so a concurrent eviction of the same digest is serialized
    /// against it. A recorded digest whose file is gone gets the staged copy.
    fn insert_large(&self, kind: EntryType, digest: &Digest, staged: NamedTempFile) -> Result<bool> {
        let large = &self.large;
        self.db
            .put_if_absent_with(kind, digest, None, now_micros(), |existed| {
                if existed {
                    if large.contains(kind, digest) {
                        return Ok(());
                    }
                    log_local_warn!("Restoring missing large blob file", digest = digest);
                }
                large.persist(staged, kind, digest)
            })
    }

    /// Load a blob. `Ok(None)` when the digest is not stored.
    ///
    /// Content is verified against the digest on every load.
    #[instrument(skip(self), level = "debug")]
    pub fn load(&self, kind: EntryType, digest: &Digest) -> Result<Option<Blob>> {
        if digest.is_empty() {
            return Ok(Some(Blob::empty()));
        }

        let blob = if !self.is_large(digest.size) {
            match self.db.get(kind, digest)? {
                Some(bytes) => Blob::Inline(bytes),
                None => return Ok(None),
            }
        } else {
            if self.db.lease(kind, digest)?.is_none() {
                return Ok(None);
            }
            match self.large.open_blob(kind, digest, self.use_mmap)? {
                Some(blob) => blob,
                // Evicted between the lease read and the open
                None if self.db.lease(kind, digest)?.is_none() => return Ok(None),
                None => {
                    return Err(CasError::MissingBlob {
                        entry_type: kind,
                        digest: *digest,
                        shard: self.db.shard_of(digest),
                        path: self.large.path(kind, digest),
                    })
                }
            }
        };

        verify(digest, &blob)?;
        self.db.touch(kind, digest, now_micros())?;
        Ok(Some(blob))
    }

    /// Whether a digest is recorded. Reads only the lease record.
    pub fn exists(&self, kind: EntryType, digest: &Digest) -> Result<bool> {
        if digest.is_empty() {
            return Ok(true);
        }
        Ok(self.db.lease(kind, digest)?.is_some())
    }

    /// Every stored digest of one namespace, read one shard at a time.
    ///
    /// Each call scans from scratch.
    pub fn list_digests(&self, kind: EntryType) -> DigestIter {
        DigestIter {
            db: self.db.clone(),
            kind,
            next_shard: 0,
            current: Vec::new().into_iter(),
        }
    }

    /// Pin digests against GC until `until`. Returns how many were present.
    pub fn lease(&self, kind: EntryType, digests: &[Digest], until: SystemTime) -> Result<usize> {
        let until = to_micros(until);
        let mut pinned = 0;
        for digest in digests.iter().filter(|d| !d.is_empty()) {
            if self.db.pin(kind, digest, until)? {
                pinned += 1;
            }
        }
        Ok(pinned)
    }

    /// Explicitly delete an entry, ignoring its lease.
    #[instrument(skip(self), level = "debug")]
    pub fn remove(&self, kind: EntryType, digest: &Digest) -> Result<bool> {
        if digest.is_empty() {
            return Ok(false);
        }
        if self.is_large(digest.size) {
            let large = &self.large;
            self.db
                .delete(kind, digest, || large.remove(kind, digest).map(|_| ()))
        } else {
            self.db.delete(kind, digest, || Ok(()))
        }
    }

    /// Counts and bytes per tier across both namespaces.
    pub fn stats(&self) -> Result<LocalStats> {
        let mut stats = LocalStats::default();
        for kind in EntryType::ALL {
            for (digest, _) in self.db.scan(kind)? {
                if self.is_large(digest.size) {
                    stats.large_blobs += 1;
                    stats.large_bytes += digest.size;
                } else {
                    stats.small_blobs += 1;
                    stats.small_bytes += digest.size;
                }
            }
        }
        Ok(stats)
    }

    /// Total bytes stored across both namespaces.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.stats()?.total_bytes())
    }

    /// On-disk path a large blob is stored at.
    pub fn large_blob_path(&self, kind: EntryType, digest: &Digest) -> PathBuf {
        self.large.path(kind, digest)
    }

    /// Shard a digest is recorded in.
    pub fn shard_of(&self, digest: &Digest) -> usize {
        self.db.shard_of(digest)
    }

    /// Flush and close every shard.
    pub fn shutdown(self) -> Result<()> {
        log_local_debug!("Shutting down local store", root = self.root.display());
        self.db.close()
    }
}

fn verify(expected: &Digest, content: &[u8]) -> Result<()> {
    let actual = Digest::of_bytes(content);
    if actual != *expected {
        return Err(CasError::HashMismatch {
            expected: *expected,
            actual,
        });
    }
    Ok(())
}

/// Statistics about the local store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStats {
    /// Blobs stored inline in the shard databases
    pub small_blobs: u64,
    pub small_bytes: u64,
    /// Blobs stored as files
    pub large_blobs: u64,
    pub large_bytes: u64,
}

impl LocalStats {
    pub fn blob_count(&self) -> u64 {
        self.small_blobs + self.large_blobs
    }

    pub fn total_bytes(&self) -> u64 {
        self.small_bytes + self.large_bytes
    }
}

/// Lazy iterator over the digests of one namespace.
pub struct DigestIter {
    db: ShardedLmdb,
    kind: EntryType,
    next_shard: usize,
    current: std::vec::IntoIter<Digest>,
}

impl Iterator for DigestIter {
    type Item = Result<Digest>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(digest) = self.current.next() {
                return Some(Ok(digest));
            }
            if self.next_shard >= self.db.shard_count() {
                return None;
            }
            let shard = self.next_shard;
            self.next_shard += 1;
            match self.db.digests_in_shard(self.kind, shard) {
                Ok(digests) => self.current = digests.into_iter(),
                Err(e) => {
                    self.next_shard = self.db.shard_count();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Chunked writer for one blob, staged in a temp file until committed.
///
/// Dropping the writer without committing discards the staged bytes.
pub struct LargeBlobWriter {
    store: LocalStore,
    kind: EntryType,
    expected: Option<Digest>,
    file: BufWriter<NamedTempFile>,
    hasher: DigestHasher,
    written: u64,
}

impl LargeBlobWriter {
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += chunk.len() as u64;
        if let Some(expected) = self.expected {
            if self.written > expected.size {
                return Err(CasError::HashMismatch {
                    expected,
                    actual: Digest::new(expected.hash, self.written),
                });
            }
        }
        self.hasher.update(chunk);
        let path = self.file.get_ref().path().to_path_buf();
        self.file.write_all(chunk).map_err(CasError::io(&path))
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verify, then move the staged bytes to their final place.
    pub fn commit(self) -> Result<Digest> {
        let Self {
            store,
            kind,
            expected,
            file,
            hasher,
            ..
        } = self;

        let digest = hasher.finish();
        if let Some(expected) = expected {
            if digest != expected {
                return Err(CasError::HashMismatch {
                    expected,
                    actual: digest,
                });
            }
        }
        if digest == EMPTY_DIGEST {
            return Ok(digest);
        }

        let staged = file
            .into_inner()
            .map_err(|e| CasError::io(&store.large.root().join(".staging"))(e.into_error()))?;
        staged
            .as_file()
            .sync_all()
            .map_err(CasError::io(staged.path()))?;

        if store.is_large(digest.size) {
            store.insert_large(kind, &digest, staged)?;
        } else {
            // Shrunk below the threshold while being read
            let bytes = fs::read(staged.path()).map_err(CasError::io(staged.path()))?;
            store.db.put_if_absent(kind, &digest, &bytes, now_micros())?;
        }
        Ok(digest)
    }
}
