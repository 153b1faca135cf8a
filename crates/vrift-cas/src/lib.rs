//! # vrift-cas
//!
//! Local content-addressable storage for vrift.
//!
//! Content is identified by a [`Digest`] (SHA-256 plus length) and kept in
//! one of two namespaces picked by [`EntryType`]. Small blobs live inline in
//! a fixed table of LMDB shards; large blobs live as files in a fan-out tree
//! and are read back through a memory map.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! ├── lmdb/
//! │   ├── 00/            # one LMDB environment per shard
//! │   ├── 01/
//! │   └── ...
//! └── large/
//!     ├── .staging/
//!     ├── files/ab/cd/<hash>_<size>
//!     └── directories/ab/cd/<hash>_<size>
//! ```
//!
//! Every stored digest has a lease record in its shard. Reads and writes
//! refresh it; [`LocalStore::lease`] pins it; garbage collection only evicts
//! entries whose lease has lapsed.

mod blob;
mod digest;
mod error;
mod gc;
mod large;
mod lease;
mod local;
mod sharded_lmdb;

pub use blob::{Blob, BlobChunks};
pub use digest::{Digest, DigestHasher, EntryType, Fingerprint, EMPTY_DIGEST, HASH_LEN, KEY_LEN};
pub use error::{CasError, FaultKind, Result};
pub use gc::{GcCandidate, GcPlan, GcReport};
pub use lease::{now_micros, to_micros, LeaseRecord};
pub use local::{DigestIter, LargeBlobWriter, LocalStats, LocalStore};
pub use sharded_lmdb::{shard_index, Eviction, ShardedLmdb};
