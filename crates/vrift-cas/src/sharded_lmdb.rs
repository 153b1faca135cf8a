//! A fixed table of independent LMDB environments.
//!
//! Each shard is its own environment under `<root>/<index:02x>/`, holding four
//! databases: content and lease records for each [`EntryType`]. A digest maps
//! to exactly one shard through [`shard_index`]. Writers in one shard never
//! wait on another shard; LMDB readers never block.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes as InlineBytes;
use heed::types::{Bytes, SerdeBincode};
use heed::{Database, Env, EnvOpenOptions};
use rayon::prelude::*;
use tracing::debug;

use crate::digest::{Digest, EntryType, Fingerprint};
use crate::lease::{now_micros, LeaseRecord};
use crate::{CasError, Result};

type ContentDb = Database<Bytes, Bytes>;
type LeaseDb = Database<Bytes, SerdeBincode<LeaseRecord>>;

/// Select the shard for a hash from its four leading bytes.
///
/// Pure and stable: the same hash always maps to the same shard for a given
/// `shard_count`.
#[inline]
pub fn shard_index(hash: &Fingerprint, shard_count: usize) -> usize {
    let prefix = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    prefix as usize % shard_count
}

/// Result of a conditional eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Deleted; carries the freed size
    Evicted(u64),
    /// Kept: touched after the scan started, still within retention, or pinned
    Live,
    /// Already gone
    Absent,
}

struct Shard {
    index: usize,
    path: PathBuf,
    env: Env,
    content: [ContentDb; 2],
    leases: [LeaseDb; 2],
}

impl Shard {
    fn open(index: usize, path: PathBuf, map_size: usize) -> Result<Self> {
        fs::create_dir_all(&path).map_err(CasError::io(&path))?;

        // Safety: each shard directory is opened once per process and never
        // truncated underneath the mapping.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_readers(ShardedLmdb::MAX_READERS)
                .max_dbs(4)
                .open(&path)
        }
        .map_err(CasError::lmdb(index))?;

        let mut wtxn = env.write_txn().map_err(CasError::lmdb(index))?;
        let files: ContentDb = env
            .create_database(&mut wtxn, Some("files"))
            .map_err(CasError::lmdb(index))?;
        let directories: ContentDb = env
            .create_database(&mut wtxn, Some("directories"))
            .map_err(CasError::lmdb(index))?;
        let file_leases: LeaseDb = env
            .create_database(&mut wtxn, Some("file_leases"))
            .map_err(CasError::lmdb(index))?;
        let directory_leases: LeaseDb = env
            .create_database(&mut wtxn, Some("directory_leases"))
            .map_err(CasError::lmdb(index))?;
        wtxn.commit().map_err(CasError::lmdb(index))?;

        Ok(Self {
            index,
            path,
            env,
            content: [files, directories],
            leases: [file_leases, directory_leases],
        })
    }

    fn err(&self) -> impl FnOnce(heed::Error) -> CasError {
        CasError::lmdb(self.index)
    }

    fn scan(&self, kind: EntryType) -> Result<Vec<(Digest, LeaseRecord)>> {
        let rtxn = self.env.read_txn().map_err(self.err())?;
        let mut out = Vec::new();
        for item in self.leases[kind.index()].iter(&rtxn).map_err(self.err())? {
            let (key, record) = item.map_err(self.err())?;
            if let Some(digest) = Digest::from_key(key) {
                out.push((digest, record));
            }
        }
        Ok(out)
    }
}

/// Sharded LMDB handle. Cheap to clone; all clones share the environments.
#[derive(Clone)]
pub struct ShardedLmdb {
    root: PathBuf,
    shards: Arc<Vec<Shard>>,
}

impl std::fmt::Debug for ShardedLmdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedLmdb")
            .field("root", &self.root)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl ShardedLmdb {
    /// Maximum readers per shard
    const MAX_READERS: u32 = 126;

    /// Open (or create) `shard_count` environments under `root`.
    pub fn open<P: AsRef<Path>>(root: P, shard_count: usize, map_size: usize) -> Result<Self> {
        if shard_count == 0 {
            return Err(CasError::Config("shard_count must be non-zero".to_string()));
        }
        let root = root.as_ref().to_path_buf();
        let shards = (0..shard_count)
            .map(|index| Shard::open(index, root.join(format!("{:02x}", index)), map_size))
            .collect::<Result<Vec<_>>>()?;

        debug!("Opened {} LMDB shards at {:?}", shard_count, root);

        Ok(Self {
            root,
            shards: Arc::new(shards),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a digest.
    pub fn shard_of(&self, digest: &Digest) -> usize {
        shard_index(&digest.hash, self.shards.len())
    }

    /// Directory holding the environment of one shard.
    pub fn shard_path(&self, index: usize) -> Option<&Path> {
        self.shards.get(index).map(|s| s.path.as_path())
    }

    fn shard(&self, digest: &Digest) -> &Shard {
        &self.shards[self.shard_of(digest)]
    }

    /// Read inline content.
    pub fn get(&self, kind: EntryType, digest: &Digest) -> Result<Option<InlineBytes>> {
        let shard = self.shard(digest);
        let rtxn = shard.env.read_txn().map_err(shard.err())?;
        let value = shard.content[kind.index()]
            .get(&rtxn, &digest.to_key()[..])
            .map_err(shard.err())?;
        Ok(value.map(InlineBytes::copy_from_slice))
    }

    /// Read the lease record. Its presence means the digest is stored.
    pub fn lease(&self, kind: EntryType, digest: &Digest) -> Result<Option<LeaseRecord>> {
        let shard = self.shard(digest);
        let rtxn = shard.env.read_txn().map_err(shard.err())?;
        shard.leases[kind.index()]
            .get(&rtxn, &digest.to_key()[..])
            .map_err(shard.err())
    }

    /// Insert inline content and its lease unless the digest is already recorded.
    ///
    /// Returns `true` when this call performed the write.
    pub fn put_if_absent(
        &self,
        kind: EntryType,
        digest: &Digest,
        content: &[u8],
        now: u64,
    ) -> Result<bool> {
        self.put_if_absent_with(kind, digest, Some(content), now, |_| Ok(()))
    }

    /// Like [`put_if_absent`](Self::put_if_absent), running `on_write` inside
    /// the write transaction. It is passed `true` when the key already
    /// existed (its lease is refreshed instead of written). An error from
    /// `on_write` aborts the transaction.
    pub fn put_if_absent_with<F>(
        &self,
        kind: EntryType,
        digest: &Digest,
        content: Option<&[u8]>,
        now: u64,
        on_write: F,
    ) -> Result<bool>
    where
        F: FnOnce(bool) -> Result<()>,
    {
        let shard = self.shard(digest);
        let key = digest.to_key();
        let leases = shard.leases[kind.index()];

        let mut wtxn = shard.env.write_txn().map_err(shard.err())?;

        if let Some(mut record) = leases.get(&wtxn, &key[..]).map_err(shard.err())? {
            record.last_access = record.last_access.max(now);
            leases
                .put(&mut wtxn, &key[..], &record)
                .map_err(shard.err())?;
            on_write(true)?;
            wtxn.commit().map_err(shard.err())?;
            return Ok(false);
        }

        if let Some(bytes) = content {
            shard.content[kind.index()]
                .put(&mut wtxn, &key[..], bytes)
                .map_err(shard.err())?;
        }
        leases
            .put(&mut wtxn, &key[..], &LeaseRecord::new(digest.size, now))
            .map_err(shard.err())?;
        on_write(false)?;
        wtxn.commit().map_err(shard.err())?;
        Ok(true)
    }

    /// Refresh the last-access time. Returns the updated record, if any.
    pub fn touch(&self, kind: EntryType, digest: &Digest, now: u64) -> Result<Option<LeaseRecord>> {
        self.update_lease(kind, digest, |record| {
            record.last_access = record.last_access.max(now)
        })
    }

    /// Pin an entry against GC until `until` (lease micros).
    pub fn pin(&self, kind: EntryType, digest: &Digest, until: u64) -> Result<bool> {
        let updated = self.update_lease(kind, digest, |record| {
            record.pinned_until = record.pinned_until.max(until)
        })?;
        Ok(updated.is_some())
    }

    fn update_lease<F>(&self, kind: EntryType, digest: &Digest, f: F) -> Result<Option<LeaseRecord>>
    where
        F: FnOnce(&mut LeaseRecord),
    {
        let shard = self.shard(digest);
        let key = digest.to_key();
        let leases = shard.leases[kind.index()];

        let mut wtxn = shard.env.write_txn().map_err(shard.err())?;
        let Some(mut record) = leases.get(&wtxn, &key[..]).map_err(shard.err())? else {
            return Ok(None);
        };
        f(&mut record);
        leases
            .put(&mut wtxn, &key[..], &record)
            .map_err(shard.err())?;
        wtxn.commit().map_err(shard.err())?;
        Ok(Some(record))
    }

    /// Unconditionally delete content and lease. `on_delete` runs inside the
    /// transaction when something was deleted.
    pub fn delete<F>(&self, kind: EntryType, digest: &Digest, on_delete: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let shard = self.shard(digest);
        let key = digest.to_key();

        let mut wtxn = shard.env.write_txn().map_err(shard.err())?;
        let had_lease = shard.leases[kind.index()]
            .delete(&mut wtxn, &key[..])
            .map_err(shard.err())?;
        let had_content = shard.content[kind.index()]
            .delete(&mut wtxn, &key[..])
            .map_err(shard.err())?;
        if !(had_lease || had_content) {
            return Ok(false);
        }
        on_delete()?;
        wtxn.commit().map_err(shard.err())?;
        Ok(true)
    }

    /// Delete an entry only if its lease still allows it.
    ///
    /// The record is re-read under the shard's write transaction: an entry
    /// accessed after `scan_started`, accessed within `retention`, or pinned
    /// is kept.
    pub fn evict_if_stale<F>(
        &self,
        kind: EntryType,
        digest: &Digest,
        scan_started: u64,
        retention: Duration,
        on_evict: F,
    ) -> Result<Eviction>
    where
        F: FnOnce() -> Result<()>,
    {
        let shard = self.shard(digest);
        let key = digest.to_key();
        let leases = shard.leases[kind.index()];

        let mut wtxn = shard.env.write_txn().map_err(shard.err())?;
        let Some(record) = leases.get(&wtxn, &key[..]).map_err(shard.err())? else {
            return Ok(Eviction::Absent);
        };
        if record.last_access > scan_started || record.is_live(now_micros(), retention) {
            return Ok(Eviction::Live);
        }

        leases.delete(&mut wtxn, &key[..]).map_err(shard.err())?;
        shard.content[kind.index()]
            .delete(&mut wtxn, &key[..])
            .map_err(shard.err())?;
        on_evict()?;
        wtxn.commit().map_err(shard.err())?;
        Ok(Eviction::Evicted(record.size))
    }

    /// Every lease record of one namespace, scanning shards in parallel.
    pub fn scan(&self, kind: EntryType) -> Result<Vec<(Digest, LeaseRecord)>> {
        let per_shard = self
            .shards
            .par_iter()
            .map(|shard| shard.scan(kind))
            .collect::<Result<Vec<_>>>()?;
        Ok(per_shard.into_iter().flatten().collect())
    }

    /// Digests recorded in one shard.
    pub fn digests_in_shard(&self, kind: EntryType, index: usize) -> Result<Vec<Digest>> {
        match self.shards.get(index) {
            Some(shard) => Ok(shard.scan(kind)?.into_iter().map(|(d, _)| d).collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Flush every shard to disk.
    pub fn sync(&self) -> Result<()> {
        for shard in self.shards.iter() {
            shard.env.force_sync().map_err(shard.err())?;
        }
        Ok(())
    }

    /// Flush and close every environment.
    ///
    /// If other clones of this handle are still alive the environments stay
    /// open until the last clone is dropped.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        match Arc::try_unwrap(self.shards) {
            Ok(shards) => {
                for shard in shards {
                    shard.env.prepare_for_closing().wait();
                }
                debug!("Closed LMDB shards at {:?}", self.root);
            }
            Err(_) => {
                vrift_config::log_local_warn!(
                    "Shards still shared at shutdown; closing deferred to last handle",
                    root = self.root.display()
                );
            }
        }
        Ok(())
    }
}
