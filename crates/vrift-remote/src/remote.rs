//! Client for a remote CAS service.
//!
//! Small blobs travel in batches bounded by digest count and total bytes;
//! blobs larger than one batch stream in chunks. Concurrent loads of the
//! same digest share one request. A streamed read that fails partway is
//! restarted from the first byte.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::{try_join_all, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::instrument;

use vrift_cas::{Blob, Digest, EntryType};
use vrift_config::{log_remote_debug, log_remote_info, RemoteConfig};

use crate::error::{RemoteError, Result};
use crate::inflight::InFlight;
use crate::provider::{CasProvider, ChunkStream, Code, Status};
use crate::retry::{deadline_exceeded, RetryPolicy};

/// Upper bound on the buffer reserved up front for a streamed read; the
/// digest's claimed size is not trusted before bytes arrive.
const MAX_PREALLOC: u64 = 4 * 1024 * 1024;

/// Per-client limits, after reconciling configuration with the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_batch_digests: usize,
    /// Also the largest blob sent or fetched through a batch call
    pub max_batch_bytes: u64,
    pub chunk_size: usize,
    pub upload_concurrency: usize,
}

impl Limits {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            max_batch_digests: config.max_batch_digests.max(1),
            max_batch_bytes: config.max_batch_total_bytes.max(1),
            chunk_size: config.chunk_size.max(1),
            upload_concurrency: config.upload_concurrency.max(1),
        }
    }
}

/// What an upload sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub batches: usize,
    pub batched_blobs: usize,
    pub streamed_blobs: usize,
    pub bytes: u64,
}

impl UploadReport {
    fn merge(&mut self, other: UploadReport) {
        self.batches += other.batches;
        self.batched_blobs += other.batched_blobs;
        self.streamed_blobs += other.streamed_blobs;
        self.bytes += other.bytes;
    }
}

type ReadKey = (EntryType, Digest);

/// Remote store handle. Cheap to clone; clones share the provider and the
/// in-flight read table.
#[derive(Clone)]
pub struct RemoteStore {
    provider: Arc<dyn CasProvider>,
    limits: Limits,
    retry: RetryPolicy,
    reads: InFlight<ReadKey, Option<Bytes>, RemoteError>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("limits", &self.limits)
            .field("retry", &self.retry)
            .field("reads_in_flight", &self.reads.len())
            .finish()
    }
}

impl RemoteStore {
    /// A client using only the configured limits.
    pub fn new(provider: Arc<dyn CasProvider>, config: &RemoteConfig) -> Self {
        Self {
            provider,
            limits: Limits::from_config(config),
            retry: RetryPolicy::from_config(config),
            reads: InFlight::new(),
        }
    }

    /// A client whose batch byte cap is the smaller of the configured one
    /// and the one the service advertises.
    pub async fn connect(provider: Arc<dyn CasProvider>, config: &RemoteConfig) -> Result<Self> {
        let mut store = Self::new(provider, config);
        let p = Arc::clone(&store.provider);
        let caps = store
            .retry
            .run("capabilities", || {
                let p = Arc::clone(&p);
                async move { p.capabilities().await }
            })
            .await?;
        if let Some(cap) = caps.max_batch_total_bytes.filter(|&cap| cap > 0) {
            store.limits.max_batch_bytes = store.limits.max_batch_bytes.min(cap);
        }
        log_remote_info!(
            "Connected to remote CAS",
            instance = config.instance_name,
            max_batch_bytes = store.limits.max_batch_bytes,
            max_batch_digests = store.limits.max_batch_digests
        );
        Ok(store)
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Whether a blob of `size` bytes travels through a batch call.
    pub fn is_batchable(&self, size: u64) -> bool {
        size <= self.limits.max_batch_bytes
    }

    /// The digests the service does not hold.
    ///
    /// Requests are split at the batch digest cap and sent concurrently; any
    /// failing partition fails the whole call.
    #[instrument(skip(self, digests), level = "debug")]
    pub async fn find_missing<I>(&self, digests: I) -> Result<HashSet<Digest>>
    where
        I: IntoIterator<Item = Digest>,
    {
        let requested: HashSet<Digest> = digests.into_iter().filter(|d| !d.is_empty()).collect();
        if requested.is_empty() {
            return Ok(HashSet::new());
        }
        let all: Vec<Digest> = requested.iter().copied().collect();

        let partitions = all.chunks(self.limits.max_batch_digests).map(|chunk| {
            let chunk = chunk.to_vec();
            let p = Arc::clone(&self.provider);
            self.retry.run("find_missing", move || {
                let p = Arc::clone(&p);
                let chunk = chunk.clone();
                async move { p.find_missing_blobs(chunk).await }
            })
        });
        let results = try_join_all(partitions).await?;

        let missing: HashSet<Digest> = results
            .into_iter()
            .flatten()
            .filter(|d| requested.contains(d))
            .collect();
        log_remote_debug!(
            "find_missing",
            requested = requested.len(),
            missing = missing.len()
        );
        Ok(missing)
    }

    /// Fetch one blob. `Ok(None)` only when the service confirms absence.
    ///
    /// Concurrent calls for the same digest share one request.
    #[instrument(skip(self), level = "debug")]
    pub async fn load(&self, kind: EntryType, digest: Digest) -> Result<Option<Bytes>> {
        if digest.is_empty() {
            return Ok(Some(Bytes::new()));
        }
        let this = self.clone();
        self.reads
            .run((kind, digest), move || async move { this.fetch(digest).await })
            .await
    }

    async fn fetch(&self, digest: Digest) -> Result<Option<Bytes>> {
        let fetched = if self.is_batchable(digest.size) {
            self.fetch_batched(digest).await?
        } else {
            self.fetch_streamed(digest).await?
        };
        match fetched {
            Some(bytes) => {
                check_content(&digest, &bytes)?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn fetch_batched(&self, digest: Digest) -> Result<Option<Bytes>> {
        let p = Arc::clone(&self.provider);
        self.retry
            .run("batch_read", || {
                let p = Arc::clone(&p);
                async move {
                    let response = p.batch_read_blobs(vec![digest]).await?;
                    match response.into_iter().find(|(d, _)| *d == digest) {
                        Some((_, Ok(bytes))) => Ok(Some(bytes)),
                        Some((_, Err(status))) if status.is_not_found() => Ok(None),
                        Some((_, Err(status))) => Err(status),
                        None => Err(Status::new(
                            Code::Internal,
                            format!("{} missing from batch read response", digest),
                        )),
                    }
                }
            })
            .await
    }

    async fn fetch_streamed(&self, digest: Digest) -> Result<Option<Bytes>> {
        self.retry
            .run_streaming("read_stream", || async move {
                match self.open_stream(digest).await? {
                    Some(stream) => collect_stream(digest, stream).await.map(Some),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Open one chunked read without buffering it. `Ok(None)` when absent.
    ///
    /// This is a single attempt: opening and every chunk after it are each
    /// held to the per-call timeout, and a stalled stream fails with
    /// `DeadlineExceeded`. Drive it through
    /// [`RetryPolicy::run_streaming`] to restart on transient failure.
    pub async fn open_stream(
        &self,
        digest: Digest,
    ) -> std::result::Result<Option<ChunkStream>, Status> {
        let timeout = self.retry.timeout;
        let opened = match tokio::time::timeout(timeout, self.provider.read_stream(digest)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(status)) if status.is_not_found() => return Ok(None),
            Ok(Err(status)) => return Err(status),
            Err(_) => return Err(deadline_exceeded(timeout)),
        };

        let mut stream = with_chunk_timeout(opened, timeout);
        // Absence may only show up as the first item
        let first = match stream.next().await {
            None => None,
            Some(Ok(first)) => Some(first),
            Some(Err(status)) if status.is_not_found() => return Ok(None),
            Some(Err(status)) => return Err(status),
        };
        Ok(Some(stream::iter(first.map(Ok)).chain(stream).boxed()))
    }

    /// Upload one blob.
    pub async fn upload(&self, kind: EntryType, digest: Digest, blob: Blob) -> Result<UploadReport> {
        self.upload_all(kind, vec![(digest, blob)]).await
    }

    /// Upload blobs, batching the small ones and streaming the rest.
    ///
    /// Streamed uploads succeed only when the service acknowledges exactly
    /// `digest.size` bytes.
    #[instrument(skip(self, blobs), fields(count = blobs.len()), level = "debug")]
    pub async fn upload_all(
        &self,
        kind: EntryType,
        blobs: Vec<(Digest, Blob)>,
    ) -> Result<UploadReport> {
        let mut small = Vec::new();
        let mut large = Vec::new();
        for (digest, blob) in blobs {
            if digest.is_empty() {
                continue;
            }
            if blob.len() as u64 != digest.size {
                return Err(RemoteError::integrity(
                    digest,
                    format!("source has {} bytes", blob.len()),
                ));
            }
            if self.is_batchable(digest.size) {
                small.push((digest, blob.to_bytes()));
            } else {
                large.push((digest, blob));
            }
        }

        let batches = self.partition_batches(small);
        let concurrency = self.limits.upload_concurrency;

        let batch_jobs = batches.into_iter().map(|batch| self.upload_batch(batch).boxed());
        let stream_jobs = large
            .into_iter()
            .map(|(digest, blob)| self.upload_streamed(digest, blob).boxed());

        let reports: Vec<UploadReport> = stream::iter(batch_jobs.chain(stream_jobs))
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;

        let mut total = UploadReport::default();
        for report in reports {
            total.merge(report);
        }
        log_remote_debug!(
            "Upload finished",
            kind = kind,
            batches = total.batches,
            streamed = total.streamed_blobs,
            bytes = total.bytes
        );
        Ok(total)
    }

    /// Greedy split by total bytes and digest count.
    fn partition_batches(&self, blobs: Vec<(Digest, Bytes)>) -> Vec<Vec<(Digest, Bytes)>> {
        let mut batches = Vec::new();
        let mut current: Vec<(Digest, Bytes)> = Vec::new();
        let mut current_bytes = 0u64;
        for (digest, bytes) in blobs {
            let full = current.len() >= self.limits.max_batch_digests
                || current_bytes + digest.size > self.limits.max_batch_bytes;
            if full && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += digest.size;
            current.push((digest, bytes));
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    async fn upload_batch(&self, batch: Vec<(Digest, Bytes)>) -> Result<UploadReport> {
        let bytes: u64 = batch.iter().map(|(d, _)| d.size).sum();
        let count = batch.len();
        let p = Arc::clone(&self.provider);
        self.retry
            .run("batch_update", || {
                let p = Arc::clone(&p);
                let batch = batch.clone();
                async move {
                    let sent: Vec<Digest> = batch.iter().map(|(d, _)| *d).collect();
                    let response = p.batch_update_blobs(batch).await?;
                    check_acks(&sent, response)
                }
            })
            .await?;
        Ok(UploadReport {
            batches: 1,
            batched_blobs: count,
            streamed_blobs: 0,
            bytes,
        })
    }

    async fn upload_streamed(&self, digest: Digest, blob: Blob) -> Result<UploadReport> {
        let p = Arc::clone(&self.provider);
        let chunk_size = self.limits.chunk_size;
        let committed = self
            .retry
            .run("write_stream", || {
                let p = Arc::clone(&p);
                let chunks = stream::iter(blob.chunks(chunk_size)).boxed();
                async move { p.write_stream(digest, chunks).await }
            })
            .await?;

        if committed != digest.size {
            return Err(RemoteError::integrity(
                digest,
                format!("service committed {} bytes", committed),
            ));
        }
        Ok(UploadReport {
            batches: 0,
            batched_blobs: 0,
            streamed_blobs: 1,
            bytes: digest.size,
        })
    }
}

/// Fail a stream with `DeadlineExceeded` once no chunk arrives for `timeout`.
fn with_chunk_timeout(stream: ChunkStream, timeout: Duration) -> ChunkStream {
    stream::unfold(Some(stream), move |state| async move {
        let Some(mut stream) = state else {
            return None;
        };
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((Err(deadline_exceeded(timeout)), None)),
        }
    })
    .boxed()
}

async fn collect_stream(
    digest: Digest,
    mut stream: ChunkStream,
) -> std::result::Result<Bytes, Status> {
    let mut buf = BytesMut::with_capacity(digest.size.min(MAX_PREALLOC) as usize);
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
        // Oversized content fails verification; stop reading it
        if buf.len() as u64 > digest.size {
            break;
        }
    }
    Ok(buf.freeze())
}

/// Every sent digest must come back acknowledged. An item the service
/// left out of its response was not stored.
fn check_acks(
    sent: &[Digest],
    response: Vec<(Digest, std::result::Result<(), Status>)>,
) -> std::result::Result<(), Status> {
    let mut acked = HashSet::with_capacity(sent.len());
    for (digest, result) in response {
        result?;
        acked.insert(digest);
    }
    match sent.iter().find(|d| !acked.contains(*d)) {
        Some(digest) => Err(Status::new(
            Code::Aborted,
            format!("{} not acknowledged by batch update", digest),
        )),
        None => Ok(()),
    }
}

fn check_content(digest: &Digest, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 != digest.size {
        return Err(RemoteError::integrity(
            *digest,
            format!("received {} bytes", bytes.len()),
        ));
    }
    let actual = Digest::of_bytes(bytes);
    if actual != *digest {
        return Err(RemoteError::integrity(
            *digest,
            format!("received content hashes to {}", actual),
        ));
    }
    Ok(())
}
