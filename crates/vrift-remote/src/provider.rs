//! The seam between the client and a remote CAS service.
//!
//! [`CasProvider`] mirrors the RPCs of the remote CAS protocol: batch
//! existence check, batch read, batch write, and chunked streaming read and
//! write. Transport, authentication and TLS live behind an implementation of
//! this trait.

use bytes::Bytes;
use futures::stream::BoxStream;
use vrift_cas::Digest;

/// Status codes a remote call can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    NotFound,
    InvalidArgument,
    PermissionDenied,
    Unauthenticated,
    FailedPrecondition,
    ResourceExhausted,
    Aborted,
    Unavailable,
    DeadlineExceeded,
    Internal,
    Unknown,
}

impl Code {
    /// Whether the same request may succeed when sent again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::Unavailable
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Internal
        )
    }
}

/// A failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(digest: &Digest) -> Self {
        Self::new(Code::NotFound, format!("{} not found", digest))
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Code::NotFound
    }
}

/// Limits the service advertises about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Largest total payload accepted by one batch read or write; `None` when
    /// the service does not say.
    pub max_batch_total_bytes: Option<u64>,
}

/// Chunks of a streamed read.
pub type ChunkStream = BoxStream<'static, Result<Bytes, Status>>;

/// Chunks handed to a streamed write.
pub type UploadStream = BoxStream<'static, Bytes>;

/// A remote content-addressed store.
///
/// All methods are safe to call concurrently.
#[async_trait::async_trait]
pub trait CasProvider: Send + Sync + 'static {
    async fn capabilities(&self) -> Result<Capabilities, Status>;

    /// The subset of `digests` the service does not hold.
    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status>;

    /// Read several small blobs at once. Each digest gets its own result; a
    /// per-item `NotFound` means that blob is absent.
    async fn batch_read_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<(Digest, Result<Bytes, Status>)>, Status>;

    /// Write several small blobs at once, with a per-item result.
    async fn batch_update_blobs(
        &self,
        blobs: Vec<(Digest, Bytes)>,
    ) -> Result<Vec<(Digest, Result<(), Status>)>, Status>;

    /// Open a chunked read of one blob. Absence is reported as `NotFound`
    /// either here or as the stream's first item.
    async fn read_stream(&self, digest: Digest) -> Result<ChunkStream, Status>;

    /// Stream one blob up. Returns the committed size the service reports.
    async fn write_stream(&self, digest: Digest, chunks: UploadStream) -> Result<u64, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_codes() {
        for code in [Code::Unavailable, Code::DeadlineExceeded, Code::ResourceExhausted] {
            assert!(code.is_retryable(), "{:?}", code);
        }
        for code in [
            Code::NotFound,
            Code::InvalidArgument,
            Code::PermissionDenied,
            Code::Unauthenticated,
        ] {
            assert!(!code.is_retryable(), "{:?}", code);
        }
    }

    #[test]
    fn test_status_display() {
        let status = Status::new(Code::Unavailable, "connection reset");
        assert_eq!(status.to_string(), "Unavailable: connection reset");
        assert!(Status::not_found(&vrift_cas::EMPTY_DIGEST).is_not_found());
    }
}
