//! In-process [`CasProvider`] backed by a concurrent map.
//!
//! Counts every RPC, and can be told to fail, slow down, enforce batch caps,
//! break or stall streamed reads, drop batch acknowledgements or misreport
//! committed sizes, so client behavior is observable in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use vrift_cas::Digest;

use crate::provider::{
    Capabilities, CasProvider, ChunkStream, Code, Status, UploadStream,
};

const READ_CHUNK: usize = 64 * 1024;

/// Snapshot of per-RPC call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub find_missing: usize,
    pub batch_read: usize,
    pub batch_update: usize,
    pub read_stream: usize,
    pub write_stream: usize,
}

impl CallCounts {
    /// Calls that transfer blob content from the service.
    pub fn fetches(&self) -> usize {
        self.batch_read + self.read_stream
    }

    pub fn uploads(&self) -> usize {
        self.batch_update + self.write_stream
    }
}

#[derive(Default)]
struct Counters {
    find_missing: AtomicUsize,
    batch_read: AtomicUsize,
    batch_update: AtomicUsize,
    read_stream: AtomicUsize,
    write_stream: AtomicUsize,
}

/// How a faulty streamed read ends after its healthy chunks.
#[derive(Debug, Clone, Copy)]
enum StreamFault {
    Reset,
    Stall,
}

#[derive(Debug, Clone, Copy)]
struct StreamFaults {
    remaining: usize,
    after_chunks: usize,
    fault: StreamFault,
}

#[derive(Default)]
pub struct MemoryCas {
    blobs: DashMap<Digest, Bytes>,
    counters: Counters,
    /// Remaining injected failures and the code they fail with
    failures: Mutex<Option<(usize, Code)>>,
    latency: Duration,
    max_batch_bytes: Option<u64>,
    max_batch_digests: Option<usize>,
    misreport_commits: AtomicBool,
    drop_batch_acks: AtomicBool,
    stream_faults: Mutex<Option<StreamFaults>>,
    read_chunk: Option<usize>,
}

impl MemoryCas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise and enforce a batch byte cap.
    pub fn with_batch_cap(mut self, bytes: u64) -> Self {
        self.max_batch_bytes = Some(bytes);
        self
    }

    /// Reject existence checks over more than `count` digests.
    pub fn with_max_digests(mut self, count: usize) -> Self {
        self.max_batch_digests = Some(count);
        self
    }

    /// Delay every RPC by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Serve streamed reads in chunks of `bytes`.
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = Some(bytes.max(1));
        self
    }

    /// Store content, returning its digest.
    pub fn insert(&self, content: impl Into<Bytes>) -> Digest {
        let content = content.into();
        let digest = Digest::of_bytes(&content);
        self.blobs.insert(digest, content);
        digest
    }

    /// Store `content` under a digest it does not hash to.
    pub fn insert_corrupt(&self, digest: Digest, content: impl Into<Bytes>) {
        self.blobs.insert(digest, content.into());
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.contains_key(digest)
    }

    pub fn get(&self, digest: &Digest) -> Option<Bytes> {
        self.blobs.get(digest).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Fail the next `count` RPCs with `code`.
    pub fn fail_next(&self, count: usize, code: Code) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = Some((count, code));
    }

    /// Break the next `count` streamed reads with `Unavailable` after
    /// `after_chunks` chunks, as a dropped connection would.
    pub fn reset_streams(&self, count: usize, after_chunks: usize) {
        self.set_stream_faults(count, after_chunks, StreamFault::Reset);
    }

    /// Make the next `count` streamed reads go silent after `after_chunks`
    /// chunks without ever ending.
    pub fn stall_streams(&self, count: usize, after_chunks: usize) {
        self.set_stream_faults(count, after_chunks, StreamFault::Stall);
    }

    fn set_stream_faults(&self, remaining: usize, after_chunks: usize, fault: StreamFault) {
        *self.stream_faults.lock().unwrap_or_else(|e| e.into_inner()) = Some(StreamFaults {
            remaining,
            after_chunks,
            fault,
        });
    }

    fn take_stream_fault(&self) -> Option<(usize, StreamFault)> {
        let mut faults = self.stream_faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.as_mut() {
            Some(f) if f.remaining > 0 => {
                f.remaining -= 1;
                Some((f.after_chunks, f.fault))
            }
            _ => None,
        }
    }

    /// Make batch writes answer with an empty response and store nothing.
    pub fn drop_batch_acks(&self, enabled: bool) {
        self.drop_batch_acks.store(enabled, Ordering::SeqCst);
    }

    /// Make streamed writes acknowledge one byte more than they received.
    pub fn misreport_commits(&self, enabled: bool) {
        self.misreport_commits.store(enabled, Ordering::SeqCst);
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            find_missing: c.find_missing.load(Ordering::SeqCst),
            batch_read: c.batch_read.load(Ordering::SeqCst),
            batch_update: c.batch_update.load(Ordering::SeqCst),
            read_stream: c.read_stream.load(Ordering::SeqCst),
            write_stream: c.write_stream.load(Ordering::SeqCst),
        }
    }

    async fn enter(&self, counter: &AtomicUsize) -> Result<(), Status> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.as_mut() {
            Some((remaining, code)) if *remaining > 0 => {
                *remaining -= 1;
                Err(Status::new(*code, "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn check_batch_bytes(&self, total: u64) -> Result<(), Status> {
        match self.max_batch_bytes {
            Some(cap) if total > cap => Err(Status::new(
                Code::InvalidArgument,
                format!("batch of {} bytes exceeds cap {}", total, cap),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl CasProvider for MemoryCas {
    async fn capabilities(&self) -> Result<Capabilities, Status> {
        Ok(Capabilities {
            max_batch_total_bytes: self.max_batch_bytes,
        })
    }

    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status> {
        self.enter(&self.counters.find_missing).await?;
        if let Some(cap) = self.max_batch_digests {
            if digests.len() > cap {
                return Err(Status::new(
                    Code::InvalidArgument,
                    format!("{} digests exceeds cap {}", digests.len(), cap),
                ));
            }
        }
        Ok(digests
            .into_iter()
            .filter(|d| !self.blobs.contains_key(d))
            .collect())
    }

    async fn batch_read_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<(Digest, Result<Bytes, Status>)>, Status> {
        self.enter(&self.counters.batch_read).await?;
        self.check_batch_bytes(digests.iter().map(|d| d.size).sum())?;
        Ok(digests
            .into_iter()
            .map(|d| {
                let result = self.get(&d).ok_or_else(|| Status::not_found(&d));
                (d, result)
            })
            .collect())
    }

    async fn batch_update_blobs(
        &self,
        blobs: Vec<(Digest, Bytes)>,
    ) -> Result<Vec<(Digest, Result<(), Status>)>, Status> {
        self.enter(&self.counters.batch_update).await?;
        self.check_batch_bytes(blobs.iter().map(|(_, b)| b.len() as u64).sum())?;
        if self.drop_batch_acks.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(blobs
            .into_iter()
            .map(|(digest, content)| {
                let result = if Digest::of_bytes(&content) == digest {
                    self.blobs.insert(digest, content);
                    Ok(())
                } else {
                    Err(Status::new(Code::InvalidArgument, "digest mismatch"))
                };
                (digest, result)
            })
            .collect())
    }

    async fn read_stream(&self, digest: Digest) -> Result<ChunkStream, Status> {
        self.enter(&self.counters.read_stream).await?;
        let content = self.get(&digest).ok_or_else(|| Status::not_found(&digest))?;
        let size = self.read_chunk.unwrap_or(READ_CHUNK);
        let chunks: Vec<Result<Bytes, Status>> = (0..content.len())
            .step_by(size)
            .map(|start| Ok(content.slice(start..(start + size).min(content.len()))))
            .collect();
        let chunks = stream::iter(chunks);
        Ok(match self.take_stream_fault() {
            None => chunks.boxed(),
            Some((after, StreamFault::Reset)) => chunks
                .take(after)
                .chain(stream::iter([Err(Status::new(
                    Code::Unavailable,
                    "connection reset",
                ))]))
                .boxed(),
            Some((after, StreamFault::Stall)) => chunks.take(after).chain(stream::pending()).boxed(),
        })
    }

    async fn write_stream(&self, digest: Digest, mut chunks: UploadStream) -> Result<u64, Status> {
        self.enter(&self.counters.write_stream).await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            buf.extend_from_slice(&chunk);
        }
        let content = buf.freeze();
        if Digest::of_bytes(&content) != digest {
            return Err(Status::new(Code::InvalidArgument, "digest mismatch"));
        }
        let len = content.len() as u64;
        self.blobs.insert(digest, content);
        if self.misreport_commits.load(Ordering::SeqCst) {
            Ok(len + 1)
        } else {
            Ok(len)
        }
    }
}
