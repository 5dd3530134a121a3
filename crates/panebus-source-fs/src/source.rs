//! Filesystem source state: routing, batching, probe bookkeeping and
//! envelope emission for every registered root.
//!
//! This is the confined, synchronous half of the filesystem source. The
//! runtime crate owns the watcher and the worker pool; it feeds raw paths in
//! through [`FilesystemSourceState::ingest`], flushes due roots, hands
//! [`ProbeRequest`]s to workers and posts their [`ProbeOutcome`]s back.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use panebus_core::event::FilesystemEvent;
use panebus_core::types::SourceSequencer;
use panebus_core::{EventSource, PaneEvent, PaneEventEnvelope, SourceFacets, WorktreeId};

use crate::batcher::{BatchPolicy, Batcher};
use crate::canonical::{default_case_insensitive, lexical_normalize};
use crate::error::FsSourceError;
use crate::ownership::{ActivityTier, RegisteredRoot, RootTable};
use crate::reconcile::{ReconcileReason, diff_reports};
use crate::status::{StatusError, StatusReport};

// ─── Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsSourceConfig {
    pub batch: BatchPolicy,
    pub case_insensitive: bool,
    /// Directory names whose contents only trigger a status recompute.
    pub ignore_dirs: Vec<String>,
}

impl Default for FsSourceConfig {
    fn default() -> Self {
        Self {
            batch: BatchPolicy::default(),
            case_insensitive: default_case_insensitive(),
            ignore_dirs: vec![".git".to_string()],
        }
    }
}

// ─── Probe messages ───────────────────────────────────────────────

/// Work order for a status probe. Carries plain values only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub worktree_id: WorktreeId,
    pub root_path: PathBuf,
    pub generation: u64,
    pub reason: ReconcileReason,
}

/// Probe result posted back into the source.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub worktree_id: WorktreeId,
    pub generation: u64,
    pub reason: ReconcileReason,
    pub result: Result<StatusReport, StatusError>,
}

impl ProbeOutcome {
    pub fn for_request(request: &ProbeRequest, result: Result<StatusReport, StatusError>) -> Self {
        Self {
            worktree_id: request.worktree_id.clone(),
            generation: request.generation,
            reason: request.reason,
            result,
        }
    }
}

/// Envelopes produced by one step, plus follow-up probe work.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub envelopes: Vec<PaneEventEnvelope>,
    pub probes: Vec<ProbeRequest>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub routed: usize,
    pub status_only: usize,
    pub unowned: usize,
}

// ─── State ────────────────────────────────────────────────────────

#[derive(Debug)]
struct RootState {
    generation: u64,
    last_report: Option<StatusReport>,
    probe_in_flight: bool,
    queued_reason: Option<ReconcileReason>,
}

#[derive(Debug)]
pub struct FilesystemSourceState {
    table: RootTable,
    batcher: Batcher,
    roots: HashMap<WorktreeId, RootState>,
    sequencer: SourceSequencer,
    next_generation: u64,
    focused_root: Option<WorktreeId>,
    ignore_dirs: Vec<String>,
}

impl FilesystemSourceState {
    pub fn new(config: FsSourceConfig, epoch: u64) -> Self {
        Self {
            table: RootTable::new(config.case_insensitive),
            batcher: Batcher::new(config.batch),
            roots: HashMap::new(),
            sequencer: SourceSequencer::new(epoch),
            next_generation: 1,
            focused_root: None,
            ignore_dirs: config.ignore_dirs,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.sequencer.epoch()
    }

    pub fn root(&self, worktree_id: &WorktreeId) -> Option<&RegisteredRoot> {
        self.table.get(worktree_id)
    }

    pub fn roots(&self) -> impl Iterator<Item = &RegisteredRoot> {
        self.table.iter()
    }

    pub fn focused_root(&self) -> Option<&WorktreeId> {
        self.focused_root.as_ref()
    }

    pub fn last_report(&self, worktree_id: &WorktreeId) -> Option<&StatusReport> {
        self.roots.get(worktree_id)?.last_report.as_ref()
    }

    pub fn probe_in_flight(&self, worktree_id: &WorktreeId) -> bool {
        self.roots.get(worktree_id).is_some_and(|r| r.probe_in_flight)
    }

    // ── Registration ──

    /// Register a root. `canonical_root` must already be canonicalized.
    /// Returns the initial status probe for the root.
    pub fn register(
        &mut self,
        worktree_id: WorktreeId,
        canonical_root: PathBuf,
        tier: ActivityTier,
    ) -> Result<ProbeRequest, FsSourceError> {
        let root = self.table.insert(worktree_id.clone(), canonical_root, tier)?;
        debug!(
            worktree_id = %worktree_id,
            root = %root.root_path.display(),
            parent = ?root.parent,
            tier = root.activity_tier.as_str(),
            "registered root"
        );
        let generation = self.next_generation;
        self.next_generation += 1;
        self.roots.insert(
            worktree_id.clone(),
            RootState {
                generation,
                last_report: None,
                probe_in_flight: false,
                queued_reason: None,
            },
        );
        self.begin_probe(&worktree_id, ReconcileReason::Wake)
            .ok_or(FsSourceError::NotRegistered(worktree_id))
    }

    /// Remove a root. Pending batch work is discarded and any in-flight probe
    /// result for it will be ignored when it arrives.
    pub fn unregister(&mut self, worktree_id: &WorktreeId) -> Result<RegisteredRoot, FsSourceError> {
        let removed = self.table.remove(worktree_id)?;
        let dropped = self.batcher.drop_root(worktree_id);
        let in_flight = self
            .roots
            .remove(worktree_id)
            .is_some_and(|r| r.probe_in_flight);
        if self.focused_root.as_ref() == Some(worktree_id) {
            self.focused_root = None;
        }
        debug!(
            worktree_id = %worktree_id,
            dropped_batch = dropped,
            cancelled_probe = in_flight,
            "unregistered root"
        );
        Ok(removed)
    }

    pub fn set_activity_tier(
        &mut self,
        worktree_id: &WorktreeId,
        tier: ActivityTier,
    ) -> Result<(), FsSourceError> {
        self.table.set_activity_tier(worktree_id, tier)
    }

    /// Root backing the focused pane. Affects only future scheduling.
    pub fn set_focused_root(&mut self, worktree_id: Option<WorktreeId>) {
        self.focused_root = worktree_id;
    }

    // ── Push path ──

    /// Route raw absolute paths to their owning roots. Paths are expected
    /// canonical (see `canonical::canonicalize_changed`); they are only
    /// normalized lexically here.
    pub fn ingest<I>(&mut self, paths: I, now_ms: u64) -> IngestStats
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut stats = IngestStats::default();
        for raw in paths {
            let path = lexical_normalize(&raw);
            let Some((root, rel)) = self.table.owner_of(&path) else {
                stats.unowned += 1;
                continue;
            };
            let worktree_id = root.worktree_id.clone();
            if rel.as_os_str().is_empty() || self.is_ignored(&rel) {
                self.batcher.note_status_only(&worktree_id, now_ms);
                stats.status_only += 1;
            } else {
                self.batcher.note_path(&worktree_id, rel, now_ms);
                stats.routed += 1;
            }
        }
        stats
    }

    fn is_ignored(&self, rel: &Path) -> bool {
        rel.components().any(|c| {
            let part = c.as_os_str().to_string_lossy();
            self.ignore_dirs.iter().any(|d| *d == part)
        })
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.batcher.next_deadline()
    }

    /// Due roots in scheduling order: focused root first, then
    /// `active_in_app`, then `sidebar_only`; ties by worktree id.
    pub fn due_roots(&self, now_ms: u64) -> Vec<WorktreeId> {
        let mut due = self.batcher.due(now_ms);
        due.sort_by_key(|w| {
            let focused = self.focused_root.as_ref() != Some(w);
            let tier = self
                .table
                .get(w)
                .map_or(ActivityTier::SidebarOnly, |r| r.activity_tier);
            (focused, tier, w.clone())
        });
        due
    }

    /// Flush one root's pending batch: `FilesChanged` envelopes now, and a
    /// status probe request (or a queued one if a probe is in flight).
    pub fn flush_root(&mut self, worktree_id: &WorktreeId, now_ms: u64) -> StepOutput {
        let mut out = StepOutput::default();
        let Some(batch) = self.batcher.take(worktree_id, now_ms) else {
            return out;
        };
        if self.table.get(worktree_id).is_none() {
            return out;
        }
        for changeset in batch.changesets {
            debug!(
                worktree_id = %worktree_id,
                batch_seq = changeset.batch_seq,
                paths = changeset.paths.len(),
                part = changeset.part,
                parts = changeset.parts,
                "files changed"
            );
            let event = FilesystemEvent::FilesChanged(changeset);
            out.envelopes.push(self.emit(worktree_id, event, now_ms));
        }
        out.probes
            .extend(self.begin_probe(worktree_id, ReconcileReason::Flush));
        out
    }

    /// Flush every due root in scheduling order.
    pub fn flush_due(&mut self, now_ms: u64) -> StepOutput {
        let mut out = StepOutput::default();
        for worktree_id in self.due_roots(now_ms) {
            let step = self.flush_root(&worktree_id, now_ms);
            out.envelopes.extend(step.envelopes);
            out.probes.extend(step.probes);
        }
        out
    }

    // ── Pull path ──

    /// Request a pull reconciliation for one root.
    pub fn request_reconcile(
        &mut self,
        worktree_id: &WorktreeId,
        reason: ReconcileReason,
    ) -> Option<ProbeRequest> {
        self.begin_probe(worktree_id, reason)
    }

    /// Request a pull reconciliation for every root, in scheduling order.
    pub fn request_reconcile_all(&mut self, reason: ReconcileReason) -> Vec<ProbeRequest> {
        let mut ids: Vec<WorktreeId> = self.table.iter().map(|r| r.worktree_id.clone()).collect();
        ids.sort_by_key(|w| {
            let tier = self
                .table
                .get(w)
                .map_or(ActivityTier::SidebarOnly, |r| r.activity_tier);
            (self.focused_root.as_ref() != Some(w), tier, w.clone())
        });
        ids.iter()
            .filter_map(|w| self.begin_probe(w, reason))
            .collect()
    }

    /// At most one probe in flight per root. A request while one is running
    /// is queued (pull reasons take precedence over `Flush`).
    fn begin_probe(
        &mut self,
        worktree_id: &WorktreeId,
        reason: ReconcileReason,
    ) -> Option<ProbeRequest> {
        let root_path = self.table.get(worktree_id)?.root_path.clone();
        let state = self.roots.get_mut(worktree_id)?;
        if state.probe_in_flight {
            state.queued_reason = match state.queued_reason {
                Some(queued) if queued.precedence() >= reason.precedence() => Some(queued),
                _ => Some(reason),
            };
            return None;
        }
        state.probe_in_flight = true;
        Some(ProbeRequest {
            worktree_id: worktree_id.clone(),
            root_path,
            generation: state.generation,
            reason,
        })
    }

    /// Apply a probe result. Stale results (root unregistered or
    /// re-registered since the request) are discarded.
    pub fn apply_status(&mut self, outcome: ProbeOutcome, now_ms: u64) -> StepOutput {
        let mut out = StepOutput::default();
        let worktree_id = outcome.worktree_id;
        let Some(state) = self.roots.get_mut(&worktree_id) else {
            debug!(worktree_id = %worktree_id, "discarding probe for unregistered root");
            return out;
        };
        if state.generation != outcome.generation {
            debug!(
                worktree_id = %worktree_id,
                generation = outcome.generation,
                current = state.generation,
                "discarding stale probe"
            );
            return out;
        }
        state.probe_in_flight = false;
        let queued = state.queued_reason.take();

        match outcome.result {
            Ok(report) => {
                let resync = outcome.reason == ReconcileReason::Resync;
                let previous = if resync {
                    None
                } else {
                    state.last_report.as_ref()
                };
                let delta = diff_reports(previous, &report);
                let first = state.last_report.is_none();
                state.last_report = Some(report);

                // Pull reconciliation recovers missed paths; a push flush
                // already reported its own.
                if outcome.reason.is_pull()
                    && (resync || !first)
                    && !delta.changed_paths.is_empty()
                {
                    let owned = self.owned_paths(&worktree_id, delta.changed_paths);
                    for changeset in self.batcher.changesets(&worktree_id, owned, now_ms) {
                        let event = FilesystemEvent::FilesChanged(changeset);
                        out.envelopes.push(self.emit(&worktree_id, event, now_ms));
                    }
                }
                if let Some(counts) = delta.counts {
                    let event = FilesystemEvent::GitStatusChanged {
                        worktree_id: worktree_id.clone(),
                        counts,
                    };
                    out.envelopes.push(self.emit(&worktree_id, event, now_ms));
                }
                if let Some(branch) = delta.branch {
                    let event = FilesystemEvent::BranchChanged {
                        worktree_id: worktree_id.clone(),
                        branch,
                    };
                    out.envelopes.push(self.emit(&worktree_id, event, now_ms));
                }
            }
            Err(err) => {
                warn!(
                    worktree_id = %worktree_id,
                    reason = %outcome.reason,
                    error = %err,
                    "status probe failed"
                );
            }
        }

        if let Some(reason) = queued {
            out.probes.extend(self.begin_probe(&worktree_id, reason));
        }
        out
    }

    /// Keep only paths that this root owns (not shadowed by a nested root).
    fn owned_paths(
        &self,
        worktree_id: &WorktreeId,
        paths: impl IntoIterator<Item = PathBuf>,
    ) -> BTreeSet<PathBuf> {
        let Some(root) = self.table.get(worktree_id) else {
            return BTreeSet::new();
        };
        paths
            .into_iter()
            .filter(|rel| {
                self.table
                    .owner_of(&root.root_path.join(rel))
                    .is_some_and(|(owner, _)| owner.worktree_id == *worktree_id)
            })
            .collect()
    }

    fn emit(
        &mut self,
        worktree_id: &WorktreeId,
        event: FilesystemEvent,
        now_ms: u64,
    ) -> PaneEventEnvelope {
        PaneEventEnvelope::new(
            EventSource::filesystem(),
            self.sequencer.next_stamp(),
            now_ms,
            PaneEvent::Filesystem(event),
        )
        .with_facets(SourceFacets::for_worktree(worktree_id.clone()))
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use panebus_core::GitStatusCounts;

    fn wid(s: &str) -> WorktreeId {
        WorktreeId::new(s)
    }

    fn config() -> FsSourceConfig {
        FsSourceConfig {
            case_insensitive: false,
            ..FsSourceConfig::default()
        }
    }

    fn source_with(roots: &[(&str, &str)]) -> FilesystemSourceState {
        let mut s = FilesystemSourceState::new(config(), 0);
        for (id, path) in roots {
            let probe = s
                .register(wid(id), PathBuf::from(path), ActivityTier::ActiveInApp)
                .expect("register");
            s.apply_status(ProbeOutcome::for_request(&probe, Ok(StatusReport::default())), 0);
        }
        s
    }

    fn changesets(out: &StepOutput) -> Vec<(WorktreeId, Vec<PathBuf>)> {
        out.envelopes
            .iter()
            .filter_map(|e| e.event().as_changeset())
            .map(|c| (c.worktree_id.clone(), c.paths.clone()))
            .collect()
    }

    // ── 1. Nested roots ──

    #[test]
    fn nested_root_gets_exactly_one_changeset() {
        let mut s = source_with(&[("W1", "/repo"), ("W2", "/repo/nested")]);
        s.ingest([PathBuf::from("/repo/nested/file.txt")], 0);
        s.ingest([PathBuf::from("/repo/nested/file.txt")], 10);
        let out = s.flush_due(600);

        assert_eq!(
            changesets(&out),
            vec![(wid("W2"), vec![PathBuf::from("file.txt")])]
        );
        let env = &out.envelopes[0];
        assert!(env.source().is_filesystem());
        assert_eq!(env.source_facets().worktree_id, Some(wid("W2")));
        assert_eq!(out.probes.len(), 1);
        assert_eq!(out.probes[0].worktree_id, wid("W2"));
    }

    #[test]
    fn ignored_dir_only_requests_status() {
        let mut s = source_with(&[("W1", "/repo")]);
        let stats = s.ingest([PathBuf::from("/repo/.git/index")], 0);
        assert_eq!(stats.status_only, 1);
        let out = s.flush_due(500);
        assert!(changesets(&out).is_empty());
        assert_eq!(out.probes.len(), 1);
    }

    #[test]
    fn unowned_paths_counted() {
        let mut s = source_with(&[("W1", "/repo")]);
        let stats = s.ingest([PathBuf::from("/elsewhere/x")], 0);
        assert_eq!(stats.unowned, 1);
        assert!(s.next_deadline_ms().is_none());
    }

    // ── 2. Sequencing ──

    #[test]
    fn seq_strictly_increases_across_roots() {
        let mut s = source_with(&[("A", "/a"), ("B", "/b")]);
        s.ingest([PathBuf::from("/a/1"), PathBuf::from("/b/1")], 0);
        let out = s.flush_due(500);
        let seqs: Vec<u64> = out.envelopes.iter().map(|e| e.seq()).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    // ── 3. Scheduling ──

    #[test]
    fn focused_then_active_then_sidebar() {
        let mut s = source_with(&[("A", "/a"), ("B", "/b"), ("C", "/c")]);
        s.set_activity_tier(&wid("A"), ActivityTier::SidebarOnly)
            .expect("tier");
        s.set_focused_root(Some(wid("C")));
        s.ingest(
            [PathBuf::from("/a/x"), PathBuf::from("/b/x"), PathBuf::from("/c/x")],
            0,
        );
        assert_eq!(s.due_roots(500), vec![wid("C"), wid("B"), wid("A")]);
    }

    // ── 4. Unregister ──

    #[test]
    fn unregister_drops_batch_and_invalidates_probe() {
        let mut s = source_with(&[("W1", "/repo")]);
        s.ingest([PathBuf::from("/repo/a.txt")], 0);
        let probe = s
            .request_reconcile(&wid("W1"), ReconcileReason::DriftSweep)
            .expect("probe");
        s.unregister(&wid("W1")).expect("unregister");
        assert!(s.next_deadline_ms().is_none());

        let fresh = s
            .register(wid("W1"), PathBuf::from("/repo"), ActivityTier::ActiveInApp)
            .expect("re-register");
        let stale = s.apply_status(
            ProbeOutcome::for_request(
                &probe,
                Ok(StatusReport {
                    counts: GitStatusCounts {
                        changed: 9,
                        ..Default::default()
                    },
                    ..Default::default()
                }),
            ),
            100,
        );
        assert!(stale.envelopes.is_empty());
        assert!(s.probe_in_flight(&wid("W1")));
        assert_ne!(fresh.generation, probe.generation);
    }

    // ── 5. Probes ──

    #[test]
    fn one_probe_in_flight_with_queued_follow_up() {
        let mut s = source_with(&[("W1", "/repo")]);
        let first = s
            .request_reconcile(&wid("W1"), ReconcileReason::Wake)
            .expect("probe");
        assert!(s
            .request_reconcile(&wid("W1"), ReconcileReason::DriftSweep)
            .is_none());
        let out = s.apply_status(ProbeOutcome::for_request(&first, Ok(StatusReport::default())), 10);
        assert_eq!(out.probes.len(), 1);
        assert_eq!(out.probes[0].reason, ReconcileReason::DriftSweep);
    }

    #[test]
    fn pull_reconcile_is_delta_based() {
        let mut s = source_with(&[("W1", "/repo"), ("W2", "/repo/nested")]);
        let dirty = StatusReport {
            counts: GitStatusCounts {
                changed: 2,
                ..Default::default()
            },
            branch: Some("main".into()),
            dirty_paths: [PathBuf::from("a.txt"), PathBuf::from("nested/b.txt")]
                .into_iter()
                .collect(),
        };

        let probe = s
            .request_reconcile(&wid("W1"), ReconcileReason::Overflow)
            .expect("probe");
        let out = s.apply_status(ProbeOutcome::for_request(&probe, Ok(dirty.clone())), 50);
        // nested/b.txt belongs to W2 and is not reported for W1.
        assert_eq!(
            changesets(&out),
            vec![(wid("W1"), vec![PathBuf::from("a.txt")])]
        );
        let names: Vec<&str> = out.envelopes.iter().map(|e| e.event().name()).collect();
        assert_eq!(
            names,
            vec!["files_changed", "git_status_changed", "branch_changed"]
        );

        let probe = s
            .request_reconcile(&wid("W1"), ReconcileReason::DriftSweep)
            .expect("probe");
        let again = s.apply_status(ProbeOutcome::for_request(&probe, Ok(dirty)), 60);
        assert!(again.envelopes.is_empty(), "unchanged state is not re-emitted");
    }

    #[test]
    fn resync_republishes_unchanged_state() {
        let mut s = source_with(&[("W1", "/repo")]);
        let dirty = StatusReport {
            counts: GitStatusCounts {
                changed: 1,
                ..Default::default()
            },
            branch: Some("main".into()),
            dirty_paths: [PathBuf::from("a.txt")].into_iter().collect(),
        };
        let probe = s
            .request_reconcile(&wid("W1"), ReconcileReason::Wake)
            .expect("probe");
        s.apply_status(ProbeOutcome::for_request(&probe, Ok(dirty.clone())), 10);

        let probes = s.request_reconcile_all(ReconcileReason::Resync);
        assert_eq!(probes.len(), 1);
        let out = s.apply_status(ProbeOutcome::for_request(&probes[0], Ok(dirty)), 20);
        let names: Vec<&str> = out.envelopes.iter().map(|e| e.event().name()).collect();
        assert_eq!(
            names,
            vec!["files_changed", "git_status_changed", "branch_changed"]
        );
        assert_eq!(
            changesets(&out),
            vec![(wid("W1"), vec![PathBuf::from("a.txt")])]
        );
    }

    #[test]
    fn queued_resync_is_not_downgraded() {
        let mut s = source_with(&[("W1", "/repo")]);
        let first = s
            .request_reconcile(&wid("W1"), ReconcileReason::Wake)
            .expect("probe");
        assert!(s.request_reconcile(&wid("W1"), ReconcileReason::Resync).is_none());
        assert!(s.request_reconcile(&wid("W1"), ReconcileReason::DriftSweep).is_none());
        let out = s.apply_status(ProbeOutcome::for_request(&first, Ok(StatusReport::default())), 10);
        assert_eq!(out.probes[0].reason, ReconcileReason::Resync);
    }

    #[test]
    fn flush_probe_does_not_emit_paths() {
        let mut s = source_with(&[("W1", "/repo")]);
        s.ingest([PathBuf::from("/repo/a.txt")], 0);
        let out = s.flush_due(500);
        let probe = out.probes[0].clone();
        let report = StatusReport {
            counts: GitStatusCounts {
                changed: 1,
                ..Default::default()
            },
            branch: None,
            dirty_paths: [PathBuf::from("a.txt")].into_iter().collect(),
        };
        let status = s.apply_status(ProbeOutcome::for_request(&probe, Ok(report)), 600);
        let names: Vec<&str> = status.envelopes.iter().map(|e| e.event().name()).collect();
        assert_eq!(names, vec!["git_status_changed"]);
    }

    #[test]
    fn probe_failure_emits_nothing() {
        let mut s = source_with(&[("W1", "/repo")]);
        let probe = s
            .request_reconcile(&wid("W1"), ReconcileReason::Wake)
            .expect("probe");
        let err = StatusError::Failed {
            root: PathBuf::from("/repo"),
            code: 128,
            stderr: "not a git repository".into(),
        };
        let out = s.apply_status(ProbeOutcome::for_request(&probe, Err(err)), 10);
        assert!(out.envelopes.is_empty());
        assert!(!s.probe_in_flight(&wid("W1")));
    }
}
