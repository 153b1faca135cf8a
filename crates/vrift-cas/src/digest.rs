//! Content identity: a SHA-256 fingerprint plus the byte length.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Length of a content fingerprint in bytes.
pub const HASH_LEN: usize = 32;

/// Length of the database key derived from a [`Digest`] (hash ++ big-endian size).
pub const KEY_LEN: usize = HASH_LEN + 8;

/// SHA-256 hash type (32 bytes)
pub type Fingerprint = [u8; HASH_LEN];

/// The identity of a blob. Two digests are equal iff hash and size match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size: u64,
}

/// Digest of the empty byte sequence. Always present; never stored or fetched.
pub const EMPTY_DIGEST: Digest = Digest {
    hash: [
        0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
        0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
        0xb8, 0x55,
    ],
    size: 0,
};

impl Digest {
    pub const fn new(hash: Fingerprint, size: u64) -> Self {
        Self { hash, size }
    }

    /// Compute the digest of the given bytes.
    #[inline]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            hash: Sha256::digest(data).into(),
            size: data.len() as u64,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == EMPTY_DIGEST
    }

    /// Hex form of the hash.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Parse a hex hash and a size. Returns `None` for malformed hex.
    pub fn from_hex(hash_hex: &str, size: u64) -> Option<Self> {
        let mut hash = [0u8; HASH_LEN];
        hex::decode_to_slice(hash_hex, &mut hash).ok()?;
        Some(Self { hash, size })
    }

    /// Database key: the hash followed by the size, big-endian.
    pub fn to_key(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key[..HASH_LEN].copy_from_slice(&self.hash);
        key[HASH_LEN..].copy_from_slice(&self.size.to_be_bytes());
        key
    }

    /// Inverse of [`Digest::to_key`].
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != KEY_LEN {
            return None;
        }
        let hash: Fingerprint = key[..HASH_LEN].try_into().ok()?;
        let size = u64::from_be_bytes(key[HASH_LEN..].try_into().ok()?);
        Some(Self { hash, size })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash_hex(), self.size)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}/{})", self.hash_hex(), self.size)
    }
}

/// Incremental digest computation for content read in chunks.
#[derive(Clone, Default)]
pub struct DigestHasher {
    hasher: Sha256,
    size: u64,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn finish(self) -> Digest {
        Digest {
            hash: self.hasher.finalize().into(),
            size: self.size,
        }
    }
}

/// Which namespace a digest's bytes belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    /// Raw file content
    File,
    /// A serialized directory listing
    Directory,
}

impl EntryType {
    pub const ALL: [EntryType; 2] = [EntryType::File, EntryType::Directory];

    pub(crate) fn index(self) -> usize {
        match self {
            EntryType::File => 0,
            EntryType::Directory => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryType::File => "files",
            EntryType::Directory => "directories",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
