//! # vrift-remote
//!
//! Client side of the remote CAS protocol.
//!
//! [`RemoteStore`] turns the raw RPCs of a [`CasProvider`] into the
//! operations the store needs:
//!
//! - `find_missing`: existence check, partitioned at the batch digest cap
//! - `upload_all`: batched small writes and chunked streaming writes
//! - `load`: batched or streamed reads, one request per digest in flight
//!
//! Transient failures and per-call timeouts are retried with capped
//! exponential backoff ([`RetryPolicy`]); a confirmed absence is `Ok(None)`
//! and is never confused with a failure to check.

pub mod error;
pub mod inflight;
pub mod memory;
pub mod provider;
pub mod remote;
pub mod retry;

pub use error::{RemoteError, Result};
pub use inflight::InFlight;
pub use memory::{CallCounts, MemoryCas};
pub use provider::{Capabilities, CasProvider, ChunkStream, Code, Status, UploadStream};
pub use remote::{Limits, RemoteStore, UploadReport};
pub use retry::RetryPolicy;
