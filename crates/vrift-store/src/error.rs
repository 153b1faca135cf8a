use thiserror::Error;
use vrift_cas::{CasError, Digest, EntryType, FaultKind};
use vrift_remote::RemoteError;

/// Errors surfaced by [`Store`](crate::Store).
///
/// Local and remote failures stay distinct so callers can choose their own
/// fallback.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Local store: {0}")]
    Local(#[from] CasError),

    #[error("Remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("{kind} blob {digest} was asked to be uploaded but is not stored locally")]
    MissingLocally { kind: EntryType, digest: Digest },

    #[error("No remote store is configured")]
    NoRemote,

    #[error("Store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn kind(&self) -> FaultKind {
        match self {
            StoreError::Local(e) => e.kind(),
            StoreError::Remote(e) => e.kind(),
            StoreError::MissingLocally { .. } | StoreError::NoRemote | StoreError::Task(_) => {
                FaultKind::InvariantViolation
            }
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
