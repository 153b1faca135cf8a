use thiserror::Error;
use vrift_cas::{Digest, FaultKind};

use crate::provider::Status;

/// Errors surfaced by the remote store client.
///
/// Cloneable so every waiter on a shared fetch receives the same failure.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("{op} failed after {attempts} attempts: {last}")]
    Unavailable {
        op: &'static str,
        attempts: u32,
        last: Status,
    },

    #[error("{op} rejected: {status}")]
    Rejected { op: &'static str, status: Status },

    #[error("Integrity failure for {digest}: {reason}")]
    Integrity { digest: Digest, reason: String },

    #[error("Remote task failed: {0}")]
    Task(String),
}

impl RemoteError {
    pub fn kind(&self) -> FaultKind {
        match self {
            RemoteError::Unavailable { .. } => FaultKind::RemoteUnavailable,
            RemoteError::Rejected { .. } => FaultKind::RemoteRejected,
            RemoteError::Integrity { .. } => FaultKind::IntegrityFault,
            RemoteError::Task(_) => FaultKind::InvariantViolation,
        }
    }

    pub(crate) fn integrity(digest: Digest, reason: impl Into<String>) -> Self {
        RemoteError::Integrity {
            digest,
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for RemoteError {
    fn from(e: tokio::task::JoinError) -> Self {
        RemoteError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
