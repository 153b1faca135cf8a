//! Per-digest lease metadata kept next to content in every shard.
//!
//! A record exists for every stored digest, small or large. Its presence is
//! what `exists` answers from, and its timestamps decide GC eligibility.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lease metadata (bincode-encoded LMDB value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Content length in bytes
    pub size: u64,
    /// Last successful read or write, microseconds since the Unix epoch
    pub last_access: u64,
    /// Explicit pin deadline (microseconds since the Unix epoch); 0 = unpinned
    pub pinned_until: u64,
}

impl LeaseRecord {
    pub fn new(size: u64, now: u64) -> Self {
        Self {
            size,
            last_access: now,
            pinned_until: 0,
        }
    }

    /// Whether GC must keep this entry at time `now`.
    pub fn is_live(&self, now: u64, retention: Duration) -> bool {
        self.pinned_until > now || now.saturating_sub(self.last_access) < retention.as_micros() as u64
    }
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Current time in microseconds since the Unix epoch.
///
/// Strictly increasing within a process, so accesses recorded one after the
/// other always order the same way their timestamps do.
pub fn now_micros() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let mut prev = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Convert a wall-clock deadline to lease micros.
pub fn to_micros(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
