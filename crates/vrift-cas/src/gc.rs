//! Least-recently-used collection of unleased entries.
//!
//! A run has two phases. [`LocalStore::plan_gc`] scans every shard and
//! orders the unleased entries by last access. [`LocalStore::execute_gc`]
//! evicts them oldest first until the store fits the target, re-reading each
//! lease under the shard's write transaction so an entry touched after the
//! scan started survives.

use vrift_config::{log_gc_debug, log_gc_info};

use crate::digest::{Digest, EntryType};
use crate::lease::now_micros;
use crate::local::LocalStore;
use crate::sharded_lmdb::Eviction;
use crate::Result;

/// An entry eligible for eviction at scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcCandidate {
    pub kind: EntryType,
    pub digest: Digest,
    pub last_access: u64,
}

/// Result of the scan phase.
#[derive(Debug, Clone)]
pub struct GcPlan {
    /// Lease micros at which the scan began
    pub started_at: u64,
    pub target_bytes: u64,
    /// Bytes stored at scan time
    pub total_bytes: u64,
    /// Unleased entries, least recently used first
    pub candidates: Vec<GcCandidate>,
    /// Entries excluded because they were leased or pinned
    pub leased: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub evicted: usize,
    pub freed_bytes: u64,
    /// Candidates that became live after the scan
    pub skipped_live: usize,
    pub remaining_bytes: u64,
}

impl LocalStore {
    /// Scan both namespaces and order the unleased entries.
    pub fn plan_gc(&self, target_bytes: u64) -> Result<GcPlan> {
        let started_at = now_micros();
        let mut total_bytes = 0u64;
        let mut leased = 0usize;
        let mut candidates = Vec::new();

        for kind in EntryType::ALL {
            for (digest, record) in self.db.scan(kind)? {
                total_bytes += record.size;
                if record.is_live(started_at, self.retention) {
                    leased += 1;
                    continue;
                }
                candidates.push(GcCandidate {
                    kind,
                    digest,
                    last_access: record.last_access,
                });
            }
        }
        candidates.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.kind.cmp(&b.kind))
                .then_with(|| a.digest.cmp(&b.digest))
        });

        log_gc_debug!(
            "Scan complete",
            total_bytes = total_bytes,
            target_bytes = target_bytes,
            candidates = candidates.len(),
            leased = leased
        );

        Ok(GcPlan {
            started_at,
            target_bytes,
            total_bytes,
            candidates,
            leased,
        })
    }

    /// Evict the plan's candidates in order until the target is met.
    pub fn execute_gc(&self, plan: &GcPlan) -> Result<GcReport> {
        let mut report = GcReport {
            remaining_bytes: plan.total_bytes,
            ..GcReport::default()
        };

        for candidate in &plan.candidates {
            if report.remaining_bytes <= plan.target_bytes {
                break;
            }
            let GcCandidate { kind, digest, .. } = *candidate;
            let large = self.is_large(digest.size).then_some(&self.large);
            let outcome = self.db.evict_if_stale(
                kind,
                &digest,
                plan.started_at,
                self.retention,
                || match large {
                    Some(large) => large.remove(kind, &digest).map(|_| ()),
                    None => Ok(()),
                },
            )?;
            match outcome {
                Eviction::Evicted(size) => {
                    report.evicted += 1;
                    report.freed_bytes += size;
                    report.remaining_bytes = report.remaining_bytes.saturating_sub(size);
                }
                Eviction::Live => report.skipped_live += 1,
                Eviction::Absent => {
                    report.remaining_bytes = report.remaining_bytes.saturating_sub(digest.size)
                }
            }
        }

        log_gc_info!(
            "Collection finished",
            evicted = report.evicted,
            freed_bytes = report.freed_bytes,
            skipped_live = report.skipped_live,
            remaining_bytes = report.remaining_bytes
        );
        Ok(report)
    }

    /// Plan and execute in one go.
    pub fn collect_garbage(&self, target_bytes: u64) -> Result<GcReport> {
        let plan = self.plan_gc(target_bytes)?;
        self.execute_gc(&plan)
    }
}
