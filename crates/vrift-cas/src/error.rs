use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::digest::{Digest, EntryType};

/// The failure classes every storage error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Loaded or received bytes do not match the requested digest.
    IntegrityFault,
    /// The local database or filesystem failed.
    StorageFault,
    /// The remote service could not be reached within the retry budget.
    RemoteUnavailable,
    /// The remote service definitively refused the request.
    RemoteRejected,
    /// The calling layer broke a contract; this is a bug, not a condition.
    InvariantViolation,
}

/// Errors that can occur during local CAS operations
///
/// Cloneable so a single failure can be handed to every waiter of a shared
/// operation; underlying sources are kept behind `Arc`.
#[derive(Error, Debug, Clone)]
pub enum CasError {
    #[error("LMDB shard {shard} failed: {source}")]
    Lmdb {
        shard: usize,
        #[source]
        source: Arc<heed::Error>,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Digest, actual: Digest },

    #[error("{entry_type} blob {digest} is recorded in shard {shard} but {} is missing", path.display())]
    MissingBlob {
        entry_type: EntryType,
        digest: Digest,
        shard: usize,
        path: PathBuf,
    },

    #[error("Invalid store configuration: {0}")]
    Config(String),
}

impl CasError {
    pub fn kind(&self) -> FaultKind {
        match self {
            CasError::Lmdb { .. } | CasError::Io { .. } | CasError::MissingBlob { .. } => {
                FaultKind::StorageFault
            }
            CasError::HashMismatch { .. } => FaultKind::IntegrityFault,
            CasError::Config(_) => FaultKind::InvariantViolation,
        }
    }

    pub(crate) fn lmdb(shard: usize) -> impl FnOnce(heed::Error) -> CasError {
        move |source| CasError::Lmdb {
            shard,
            source: Arc::new(source),
        }
    }

    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> CasError + '_ {
        move |source| CasError::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, CasError>;
