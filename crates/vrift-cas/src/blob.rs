//! Read handles returned by the local store.

use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;

/// Loaded blob content.
///
/// Large blobs are memory-mapped; the mapping lives as long as the handle
/// (or any clone of it) and is released on drop.
#[derive(Clone)]
pub enum Blob {
    /// Owned bytes (small blobs, buffered reads)
    Inline(Bytes),
    /// Read-only view into a mapped large-blob file
    Mapped(Arc<memmap2::Mmap>),
}

impl Blob {
    pub fn empty() -> Self {
        Blob::Inline(Bytes::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Blob::Inline(bytes) => bytes,
            Blob::Mapped(mmap) => mmap,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Blob::Mapped(_))
    }

    /// Owned bytes; copies out of a mapping.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Blob::Inline(bytes) => bytes.clone(),
            Blob::Mapped(mmap) => Bytes::copy_from_slice(mmap),
        }
    }

    /// Owned, lazily copied chunks of at most `chunk_size` bytes.
    pub fn chunks(&self, chunk_size: usize) -> BlobChunks {
        BlobChunks {
            blob: self.clone(),
            offset: 0,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Deref for Blob {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_mapped() { "Mapped" } else { "Inline" };
        write!(f, "Blob::{}({} bytes)", kind, self.len())
    }
}

impl From<Bytes> for Blob {
    fn from(bytes: Bytes) -> Self {
        Blob::Inline(bytes)
    }
}

/// Iterator over a blob in owned chunks. Only one chunk is copied at a time.
pub struct BlobChunks {
    blob: Blob,
    offset: usize,
    chunk_size: usize,
}

impl Iterator for BlobChunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.offset >= self.blob.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.blob.len());
        let chunk = match &self.blob {
            Blob::Inline(bytes) => bytes.slice(self.offset..end),
            Blob::Mapped(mmap) => Bytes::copy_from_slice(&mmap[self.offset..end]),
        };
        self.offset = end;
        Some(chunk)
    }
}
