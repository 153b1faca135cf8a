//! On-disk tree for blobs at or above the large-blob threshold.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/large/
//! ├── .staging/                 # temp files, renamed into place when complete
//! ├── files/
//! │   └── ab/
//! │       └── cd/
//! │           └── abcd1234...efgh_12345   # hash_size
//! └── directories/
//!     └── ...
//! ```
//!
//! A file only ever appears under its final name fully written: content is
//! staged, synced, then renamed.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;
use vrift_config::log_local_warn;

use crate::blob::Blob;
use crate::digest::{Digest, EntryType};
use crate::{CasError, Result};

/// Staged files older than this are leftovers of a crashed writer.
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct LargeBlobs {
    root: PathBuf,
    staging: PathBuf,
}

impl LargeBlobs {
    pub fn open(root: PathBuf) -> Result<Self> {
        let staging = root.join(".staging");
        fs::create_dir_all(&staging).map_err(CasError::io(&staging))?;
        let blobs = Self { root, staging };
        blobs.sweep_staging();
        Ok(blobs)
    }

    /// Final path of a large blob: `<kind>/ab/cd/<hex>_<size>`.
    pub fn path(&self, kind: EntryType, digest: &Digest) -> PathBuf {
        let hex = digest.hash_hex();
        self.root
            .join(kind.name())
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(format!("{}_{}", hex, digest.size))
    }

    pub fn contains(&self, kind: EntryType, digest: &Digest) -> bool {
        self.path(kind, digest).is_file()
    }

    /// A new empty staging file.
    pub fn stage(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("blob-")
            .suffix(".tmp")
            .tempfile_in(&self.staging)
            .map_err(CasError::io(&self.staging))
    }

    /// Stage `data` fully written and synced.
    pub fn stage_bytes(&self, data: &[u8]) -> Result<NamedTempFile> {
        let mut temp = self.stage()?;
        let path = temp.path().to_path_buf();
        temp.write_all(data).map_err(CasError::io(&path))?;
        temp.as_file().sync_all().map_err(CasError::io(&path))?;
        Ok(temp)
    }

    /// Rename a staged file to its final path. Overwriting an existing file
    /// is harmless: both hold the same content.
    pub fn persist(&self, temp: NamedTempFile, kind: EntryType, digest: &Digest) -> Result<()> {
        let path = self.path(kind, digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(CasError::io(parent))?;
        }
        temp.persist(&path)
            .map_err(|e| CasError::io(&path)(e.error))?;
        Ok(())
    }

    /// Open a large blob. `Ok(None)` when the file does not exist.
    ///
    /// The file length is checked against the digest before mapping.
    pub fn open_blob(&self, kind: EntryType, digest: &Digest, use_mmap: bool) -> Result<Option<Blob>> {
        let path = self.path(kind, digest);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CasError::io(&path)(e)),
        };
        let len = file.metadata().map_err(CasError::io(&path))?.len();
        if len != digest.size {
            return Err(CasError::HashMismatch {
                expected: *digest,
                actual: Digest::new(digest.hash, len),
            });
        }
        if len == 0 {
            return Ok(Some(Blob::empty()));
        }
        let blob = if use_mmap {
            map_file(&file).map_err(CasError::io(&path))?
        } else {
            read_file(file, len).map_err(CasError::io(&path))?
        };
        Ok(Some(blob))
    }

    /// Remove a large blob file. `Ok(false)` when it was already gone.
    pub fn remove(&self, kind: EntryType, digest: &Digest) -> Result<bool> {
        let path = self.path(kind, digest);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CasError::io(&path)(e)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sweep_staging(&self) {
        let entries = match fs::read_dir(&self.staging) {
            Ok(entries) => entries,
            Err(e) => {
                log_local_warn!(
                    "Failed to read staging directory",
                    path = self.staging.display(),
                    error = e
                );
                return;
            }
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age > STALE_STAGING_AGE);
            if stale {
                let path = entry.path();
                if let Err(e) = fs::remove_file(&path) {
                    log_local_warn!(
                        "Failed to remove stale staging file",
                        path = path.display(),
                        error = e
                    );
                }
            }
        }
    }
}

#[cfg(any(unix, windows))]
fn map_file(file: &File) -> io::Result<Blob> {
    // Safety: blob files are immutable once renamed into place and are only
    // ever removed, never written, while mapped.
    let mmap = unsafe { memmap2::Mmap::map(file) }?;
    Ok(Blob::Mapped(std::sync::Arc::new(mmap)))
}

#[cfg(not(any(unix, windows)))]
fn map_file(file: &File) -> io::Result<Blob> {
    let len = file.metadata()?.len();
    read_file(file.try_clone()?, len)
}

fn read_file(mut file: File, len: u64) -> io::Result<Blob> {
    let mut data = Vec::with_capacity(len as usize);
    file.read_to_end(&mut data)?;
    Ok(Blob::Inline(data.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_layout() {
        let temp = TempDir::new().unwrap();
        let blobs = LargeBlobs::open(temp.path().join("large")).unwrap();
        let d = Digest::of_bytes(b"layout");
        let hex = d.hash_hex();

        let path = blobs.path(EntryType::File, &d);
        let expected = temp
            .path()
            .join("large/files")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(format!("{}_6", hex));
        assert_eq!(path, expected);
        assert_ne!(path, blobs.path(EntryType::Directory, &d));
    }

    #[test]
    fn test_stage_persist_open() {
        let temp = TempDir::new().unwrap();
        let blobs = LargeBlobs::open(temp.path().join("large")).unwrap();
        let data = vec![9u8; 4096];
        let d = Digest::of_bytes(&data);

        let staged = blobs.stage_bytes(&data).unwrap();
        blobs.persist(staged, EntryType::File, &d).unwrap();

        for use_mmap in [true, false] {
            let blob = blobs.open_blob(EntryType::File, &d, use_mmap).unwrap().unwrap();
            assert_eq!(blob.is_mapped(), use_mmap);
            assert_eq!(&blob[..], &data[..]);
        }
        // Nothing left in staging
        assert_eq!(fs::read_dir(temp.path().join("large/.staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_length_mismatch_is_integrity_error() {
        let temp = TempDir::new().unwrap();
        let blobs = LargeBlobs::open(temp.path().join("large")).unwrap();
        let data = vec![1u8; 100];
        let d = Digest::of_bytes(&data);
        blobs
            .persist(blobs.stage_bytes(&data[..50]).unwrap(), EntryType::File, &d)
            .unwrap();

        let err = blobs.open_blob(EntryType::File, &d, true).unwrap_err();
        assert!(matches!(err, CasError::HashMismatch { .. }));
    }

    #[test]
    fn test_missing_and_remove() {
        let temp = TempDir::new().unwrap();
        let blobs = LargeBlobs::open(temp.path().join("large")).unwrap();
        let d = Digest::of_bytes(b"gone");
        assert!(blobs.open_blob(EntryType::File, &d, true).unwrap().is_none());
        assert!(!blobs.remove(EntryType::File, &d).unwrap());
    }

    #[test]
    fn test_sweep_removes_only_stale_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("large");
        let staging = root.join(".staging");
        fs::create_dir_all(&staging).unwrap();

        let old = SystemTime::now() - STALE_STAGING_AGE * 2;
        let stale = staging.join("stale.tmp");
        File::create(&stale).unwrap().set_modified(old).unwrap();
        let fresh = staging.join("fresh.tmp");
        File::create(&fresh).unwrap();
        // Cannot be removed as a file; the sweep logs it and carries on
        let stuck = staging.join("stuck");
        fs::create_dir(&stuck).unwrap();
        File::open(&stuck).unwrap().set_modified(old).unwrap();

        LargeBlobs::open(root).unwrap();
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(stuck.is_dir());
    }
}
