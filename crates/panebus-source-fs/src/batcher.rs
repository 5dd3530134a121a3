//! Per-root debounced batching of changed paths.
//!
//! A root is due once it has been quiet for `debounce_ms`, or once
//! `max_latency_ms` has passed since its first pending notice, whichever
//! comes first. Pending paths are kept in a sorted set, so the emitted order
//! only depends on the set of paths seen.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use panebus_core::{FileChangeset, WorktreeId};

// ─── Constants ────────────────────────────────────────────────────

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_MAX_LATENCY_MS: u64 = 2_000;
pub const DEFAULT_MAX_BATCH_PATHS: usize = 256;

// ─── Policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPolicy {
    pub debounce_ms: u64,
    pub max_latency_ms: u64,
    pub max_batch_paths: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            max_batch_paths: DEFAULT_MAX_BATCH_PATHS,
        }
    }
}

// ─── Batcher ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingBatch {
    paths: BTreeSet<PathBuf>,
    first_notice_ms: u64,
    last_notice_ms: u64,
    status_dirty: bool,
}

impl PendingBatch {
    fn new(now_ms: u64) -> Self {
        Self {
            paths: BTreeSet::new(),
            first_notice_ms: now_ms,
            last_notice_ms: now_ms,
            status_dirty: false,
        }
    }

    fn deadline(&self, policy: &BatchPolicy) -> u64 {
        let quiet = self.last_notice_ms.saturating_add(policy.debounce_ms);
        let ceiling = self.first_notice_ms.saturating_add(policy.max_latency_ms);
        quiet.min(ceiling)
    }
}

/// Output of flushing one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch {
    /// One or more consecutive changesets; empty if only status work is due.
    pub changesets: Vec<FileChangeset>,
    /// A status recompute was requested (paths inside ignored dirs changed).
    pub status_dirty: bool,
}

#[derive(Debug, Default)]
pub struct Batcher {
    policy: BatchPolicy,
    pending: HashMap<WorktreeId, PendingBatch>,
    batch_seqs: HashMap<WorktreeId, u64>,
}

impl Batcher {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy: BatchPolicy {
                max_batch_paths: policy.max_batch_paths.max(1),
                ..policy
            },
            pending: HashMap::new(),
            batch_seqs: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    fn entry(&mut self, worktree_id: &WorktreeId, now_ms: u64) -> &mut PendingBatch {
        let batch = self
            .pending
            .entry(worktree_id.clone())
            .or_insert_with(|| PendingBatch::new(now_ms));
        batch.last_notice_ms = batch.last_notice_ms.max(now_ms);
        batch
    }

    /// Record a root-relative changed path.
    pub fn note_path(&mut self, worktree_id: &WorktreeId, rel_path: PathBuf, now_ms: u64) {
        self.entry(worktree_id, now_ms).paths.insert(rel_path);
    }

    /// Record activity that only warrants a status recompute.
    pub fn note_status_only(&mut self, worktree_id: &WorktreeId, now_ms: u64) {
        self.entry(worktree_id, now_ms).status_dirty = true;
    }

    pub fn has_pending(&self, worktree_id: &WorktreeId) -> bool {
        self.pending.contains_key(worktree_id)
    }

    pub fn pending_paths(&self, worktree_id: &WorktreeId) -> usize {
        self.pending.get(worktree_id).map_or(0, |b| b.paths.len())
    }

    pub fn deadline_for(&self, worktree_id: &WorktreeId) -> Option<u64> {
        self.pending.get(worktree_id).map(|b| b.deadline(&self.policy))
    }

    /// Earliest deadline across all roots.
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.values().map(|b| b.deadline(&self.policy)).min()
    }

    pub fn is_due(&self, worktree_id: &WorktreeId, now_ms: u64) -> bool {
        self.deadline_for(worktree_id).is_some_and(|d| now_ms >= d)
    }

    /// Roots whose deadline has passed, unordered.
    pub fn due(&self, now_ms: u64) -> Vec<WorktreeId> {
        self.pending
            .iter()
            .filter(|(_, b)| now_ms >= b.deadline(&self.policy))
            .map(|(w, _)| w.clone())
            .collect()
    }

    /// Next `batch_seq` for a root. Monotonic for the life of the batcher,
    /// including across unregister and re-register.
    pub fn next_batch_seq(&mut self, worktree_id: &WorktreeId) -> u64 {
        let seq = self.batch_seqs.entry(worktree_id.clone()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Take the pending batch for a root, splitting it into chunks of at most
    /// `max_batch_paths`.
    pub fn take(&mut self, worktree_id: &WorktreeId, now_ms: u64) -> Option<FlushedBatch> {
        let batch = self.pending.remove(worktree_id)?;
        Some(FlushedBatch {
            changesets: self.changesets(worktree_id, batch.paths, now_ms),
            status_dirty: batch.status_dirty,
        })
    }

    /// Build consecutive changesets for an already deduplicated path set,
    /// bypassing the pending queue.
    pub fn changesets(
        &mut self,
        worktree_id: &WorktreeId,
        paths: BTreeSet<PathBuf>,
        now_ms: u64,
    ) -> Vec<FileChangeset> {
        let paths: Vec<PathBuf> = paths.into_iter().collect();
        let chunks: Vec<Vec<PathBuf>> = paths
            .chunks(self.policy.max_batch_paths)
            .map(<[PathBuf]>::to_vec)
            .collect();
        let parts = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
        let mut changesets = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            changesets.push(FileChangeset {
                worktree_id: worktree_id.clone(),
                paths: chunk,
                timestamp_ms: now_ms,
                batch_seq: self.next_batch_seq(worktree_id),
                part: u32::try_from(i + 1).unwrap_or(u32::MAX),
                parts,
            });
        }
        changesets
    }

    /// Discard pending work for a root. Returns whether anything was pending.
    pub fn drop_root(&mut self, worktree_id: &WorktreeId) -> bool {
        self.pending.remove(worktree_id).is_some()
    }
}
