use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::instrument;

use vrift_cas::{Blob, CasError, Digest, EntryType, GcReport, LocalStore};
use vrift_config::{log_store_debug, log_store_info, Config, GcConfig};
use vrift_remote::{CasProvider, InFlight, RemoteStore, Status, UploadReport};

use crate::error::{Result, StoreError};

/// Chunks buffered between a streamed remote read and the local writer.
const STREAM_BUFFER: usize = 8;

/// Outcome of [`Store::upload_to_remote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// Distinct non-empty digests asked for
    pub requested: usize,
    /// Of those, already held by the remote
    pub already_present: usize,
    pub uploaded: UploadReport,
}

/// Local store in front of an optional remote store.
///
/// Cheap to clone; clones share both stores and the in-flight table.
#[derive(Clone)]
pub struct Store {
    local: LocalStore,
    remote: Option<RemoteStore>,
    ensures: InFlight<(EntryType, Digest), bool, StoreError>,
    gc: GcConfig,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("gc", &self.gc)
            .finish()
    }
}

impl Store {
    pub fn new(local: LocalStore, remote: Option<RemoteStore>, gc: GcConfig) -> Self {
        Self {
            local,
            remote,
            ensures: InFlight::new(),
            gc,
        }
    }

    /// A store with no remote.
    pub fn local_only(config: &Config) -> Result<Self> {
        let local = LocalStore::open(config)?;
        Ok(Self::new(local, None, config.gc.clone()))
    }

    /// Open the local store and, when `remote.enabled`, connect `provider`.
    pub async fn open(config: &Config, provider: Option<Arc<dyn CasProvider>>) -> Result<Self> {
        let local_config = config.clone();
        let local = tokio::task::spawn_blocking(move || LocalStore::open(&local_config)).await??;

        let remote = match (config.remote.enabled, provider) {
            (true, Some(provider)) => Some(RemoteStore::connect(provider, &config.remote).await?),
            (true, None) => return Err(StoreError::NoRemote),
            (false, Some(_)) => {
                log_store_info!("Remote provider ignored: remote.enabled is false");
                None
            }
            (false, None) => None,
        };

        log_store_info!(
            "Store opened",
            root = local.root().display(),
            remote = remote.is_some()
        );
        Ok(Self::new(local, remote, config.gc.clone()))
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn remote(&self) -> Option<&RemoteStore> {
        self.remote.as_ref()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(LocalStore) -> std::result::Result<T, CasError> + Send + 'static,
    {
        let local = self.local.clone();
        Ok(tokio::task::spawn_blocking(move || f(local)).await??)
    }

    /// Store bytes locally. Nothing is sent to the remote.
    pub async fn store_bytes(&self, kind: EntryType, bytes: Bytes) -> Result<Digest> {
        self.blocking(move |local| local.store(kind, &bytes)).await
    }

    /// Store a file's contents locally, streaming large files.
    pub async fn store_file(&self, kind: EntryType, path: PathBuf) -> Result<Digest> {
        self.blocking(move |local| local.store_file(kind, &path)).await
    }

    pub async fn exists_locally(&self, kind: EntryType, digest: Digest) -> Result<bool> {
        self.blocking(move |local| local.exists(kind, &digest)).await
    }

    /// Make a digest present locally, fetching it from the remote on a miss.
    ///
    /// Returns `false` when no store has it. Concurrent calls for the same
    /// digest share one fetch and one local write. A local failure is
    /// returned as is; it never falls back to the remote.
    #[instrument(skip(self), level = "debug")]
    pub async fn ensure_local(&self, kind: EntryType, digest: Digest) -> Result<bool> {
        if digest.is_empty() || self.exists_locally(kind, digest).await? {
            return Ok(true);
        }
        if self.remote.is_none() {
            return Ok(false);
        }

        let this = self.clone();
        self.ensures
            .run((kind, digest), move || async move {
                this.fetch_into_local(kind, digest).await
            })
            .await
    }

    async fn fetch_into_local(&self, kind: EntryType, digest: Digest) -> Result<bool> {
        // A previous slot may have finished between the check and this one
        if self.exists_locally(kind, digest).await? {
            return Ok(true);
        }
        let remote = self.remote.as_ref().ok_or(StoreError::NoRemote)?;

        if self.local.is_large(digest.size) && !remote.is_batchable(digest.size) {
            return self.stream_into_local(remote, kind, digest).await;
        }

        let Some(bytes) = remote.load(kind, digest).await? else {
            log_store_debug!("Not found remotely", kind = kind, digest = digest);
            return Ok(false);
        };
        let stored = self.blocking(move |local| local.store(kind, &bytes)).await?;
        if stored != digest {
            return Err(CasError::HashMismatch {
                expected: digest,
                actual: stored,
            }
            .into());
        }
        log_store_debug!("Fetched into local store", kind = kind, digest = digest);
        Ok(true)
    }

    /// Pipe a streamed remote read into a local large-blob writer.
    ///
    /// A transient failure anywhere in the stream discards the staged bytes
    /// and restarts the read with a fresh writer. A local failure, including
    /// content that does not match the digest, ends it.
    async fn stream_into_local(
        &self,
        remote: &RemoteStore,
        kind: EntryType,
        digest: Digest,
    ) -> Result<bool> {
        let stored = remote
            .retry_policy()
            .run_streaming("read_stream", || self.stream_attempt(remote, kind, digest))
            .await??;
        if stored {
            log_store_debug!("Streamed into local store", kind = kind, digest = digest);
        } else {
            log_store_debug!("Not found remotely", kind = kind, digest = digest);
        }
        Ok(stored)
    }

    /// One streamed read, one bounded channel to one writer. Remote failures
    /// are the outer error so the caller can retry them.
    async fn stream_attempt(
        &self,
        remote: &RemoteStore,
        kind: EntryType,
        digest: Digest,
    ) -> std::result::Result<Result<bool>, Status> {
        let Some(mut chunks) = remote.open_stream(digest).await? else {
            return Ok(Ok(false));
        };

        // `None` marks the end of a complete stream; a channel closed without
        // it means the read failed and nothing is committed
        let (tx, mut rx) = mpsc::channel::<Option<Bytes>>(STREAM_BUFFER);
        let local = self.local.clone();
        let writer = tokio::task::spawn_blocking(move || -> std::result::Result<bool, CasError> {
            let mut writer = local.large_writer(kind, Some(digest))?;
            while let Some(item) = rx.blocking_recv() {
                match item {
                    Some(chunk) => writer.write_chunk(&chunk)?,
                    None => {
                        writer.commit()?;
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        });

        let mut remote_error = None;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    // Closed means the writer already failed
                    if tx.send(Some(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(status) => {
                    remote_error = Some(status);
                    break;
                }
            }
        }
        if remote_error.is_none() && tx.send(None).await.is_err() {
            log_store_debug!("Stream writer stopped early", digest = digest);
        }
        drop(tx);

        let written = writer.await;
        if let Some(status) = remote_error {
            return Err(status);
        }
        Ok(match written {
            Ok(Ok(true)) => Ok(true),
            Ok(Ok(false)) => Err(StoreError::Task(format!(
                "writer for {} stopped before the stream ended",
                digest
            ))),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        })
    }

    /// Load a blob, local first, then remote (populating local).
    #[instrument(skip(self), level = "debug")]
    pub async fn load_bytes(&self, kind: EntryType, digest: Digest) -> Result<Option<Blob>> {
        if let Some(blob) = self.blocking(move |local| local.load(kind, &digest)).await? {
            return Ok(Some(blob));
        }
        if !self.ensure_local(kind, digest).await? {
            return Ok(None);
        }
        self.blocking(move |local| local.load(kind, &digest)).await
    }

    /// Upload whichever of `digests` the remote lacks, reading them from the
    /// local store. A digest the remote lacks that is not stored locally is
    /// a caller error.
    #[instrument(skip(self, digests), level = "debug")]
    pub async fn upload_to_remote<I>(&self, kind: EntryType, digests: I) -> Result<UploadSummary>
    where
        I: IntoIterator<Item = Digest>,
    {
        let remote = self.remote.as_ref().ok_or(StoreError::NoRemote)?;
        let requested: Vec<Digest> = digests.into_iter().filter(|d| !d.is_empty()).collect();
        let missing = remote.find_missing(requested.iter().copied()).await?;

        let mut summary = UploadSummary {
            requested: requested
                .iter()
                .collect::<std::collections::HashSet<_>>()
                .len(),
            ..UploadSummary::default()
        };
        summary.already_present = summary.requested - missing.len();
        if missing.is_empty() {
            return Ok(summary);
        }

        let local = self.local.clone();
        let wanted: Vec<Digest> = missing.into_iter().collect();
        let blobs = tokio::task::spawn_blocking(move || {
            wanted
                .into_iter()
                .map(|digest| match local.load(kind, &digest)? {
                    Some(blob) => Ok((digest, blob)),
                    None => Err(StoreError::MissingLocally { kind, digest }),
                })
                .collect::<Result<Vec<_>>>()
        })
        .await??;

        summary.uploaded = remote.upload_all(kind, blobs).await?;
        log_store_info!(
            "Uploaded to remote",
            kind = kind,
            requested = summary.requested,
            uploaded = summary.requested - summary.already_present,
            bytes = summary.uploaded.bytes
        );
        Ok(summary)
    }

    /// Pin digests against GC until `until`.
    pub async fn lease_all(
        &self,
        kind: EntryType,
        digests: Vec<Digest>,
        until: SystemTime,
    ) -> Result<usize> {
        self.blocking(move |local| local.lease(kind, &digests, until))
            .await
    }

    /// Collect garbage if the local store is over its size budget, down to
    /// `size_budget * target_ratio`. `None` when under budget.
    pub async fn garbage_collect(&self) -> Result<Option<GcReport>> {
        let budget = self.gc.size_budget;
        let target = self.gc.target_bytes();
        self.blocking(move |local| {
            let total = local.total_size()?;
            if total <= budget {
                return Ok(None);
            }
            log_store_info!(
                "Over size budget, collecting",
                total_bytes = total,
                budget = budget,
                target = target
            );
            local.collect_garbage(target).map(Some)
        })
        .await
    }

    /// Collect garbage down to `target_bytes` regardless of the budget.
    pub async fn shrink(&self, target_bytes: u64) -> Result<GcReport> {
        self.blocking(move |local| local.collect_garbage(target_bytes))
            .await
    }

    /// Flush and close the local store.
    pub fn shutdown(self) -> Result<()> {
        log_store_info!("Store shutting down", root = self.local.root().display());
        Ok(self.local.shutdown()?)
    }
}
