//! Pane projection store.
//!
//! For each bound pane, retains the filesystem events of its worktree,
//! narrowed to the pane's working-directory subtree. Changesets apply in
//! `batch_seq` order per pane; a changeset at or below the pane's cursor is
//! dropped. Consumers poll `changes_since(version)`; the change log is a
//! bounded ring, and a version older than the ring asks for a resnapshot.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

use panebus_core::{
    FileChangeset, FilesystemEvent, GitStatusCounts, PaneEvent, PaneEventEnvelope, PaneId,
    WorktreeId,
};

/// Monotonic version counter for change tracking.
pub type ProjectionVersion = u64;

/// Change log entries kept before the oldest are dropped.
pub const DEFAULT_CHANGE_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Binding,
    Files,
    Status,
    Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionChange {
    pub version: ProjectionVersion,
    pub pane_id: PaneId,
    pub kind: ChangeKind,
}

/// Portion of the worktree a pane sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Whole,
    /// Root-relative subtree.
    Subtree(PathBuf),
    /// Absolute cwd whose worktree root is unknown or does not contain it.
    Unresolved,
}

impl Scope {
    fn admits(&self, rel: &Path) -> bool {
        match self {
            Self::Whole => true,
            Self::Subtree(prefix) => rel.starts_with(prefix),
            Self::Unresolved => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaneProjection {
    pub pane_id: PaneId,
    pub worktree_id: WorktreeId,
    pub cwd: Option<PathBuf>,
    /// Root-relative paths of the latest relevant changeset (all parts).
    pub changed_paths: BTreeSet<PathBuf>,
    pub last_batch_seq: u64,
    pub status: Option<GitStatusCounts>,
    pub branch: Option<String>,
    pub updated_at_ms: u64,
    /// Set by part 1 of a split changeset: the next visible part replaces
    /// `changed_paths` instead of extending it.
    #[serde(skip)]
    pub(crate) pending_reset: bool,
}

impl PaneProjection {
    fn new(pane_id: PaneId, worktree_id: WorktreeId) -> Self {
        Self {
            pane_id,
            worktree_id,
            cwd: None,
            changed_paths: BTreeSet::new(),
            last_batch_seq: 0,
            status: None,
            branch: None,
            updated_at_ms: 0,
            pending_reset: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub panes_changed: usize,
    /// Panes whose cursor was already at or past the changeset.
    pub stale_dropped: usize,
}

#[derive(Debug)]
pub struct PaneProjectionStore {
    panes: BTreeMap<PaneId, PaneProjection>,
    worktree_roots: HashMap<WorktreeId, PathBuf>,
    version: ProjectionVersion,
    changes: VecDeque<ProjectionChange>,
    change_capacity: usize,
    /// Highest version dropped from the front of `changes`.
    trimmed_through: ProjectionVersion,
}

impl Default for PaneProjectionStore {
    fn default() -> Self {
        Self::with_change_capacity(DEFAULT_CHANGE_LOG_CAPACITY)
    }
}

impl PaneProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` is clamped to at least 1.
    pub fn with_change_capacity(capacity: usize) -> Self {
        Self {
            panes: BTreeMap::new(),
            worktree_roots: HashMap::new(),
            version: 0,
            changes: VecDeque::new(),
            change_capacity: capacity.max(1),
            trimmed_through: 0,
        }
    }

    pub fn version(&self) -> ProjectionVersion {
        self.version
    }

    pub fn snapshot(&self, pane_id: &PaneId) -> Option<&PaneProjection> {
        self.panes.get(pane_id)
    }

    pub fn panes(&self) -> impl Iterator<Item = &PaneProjection> {
        self.panes.values()
    }

    pub fn pane_count(&self) -> usize {
        self.panes.len()
    }

    /// Changes with `version > since`, or `None` if some of them have
    /// already been dropped from the log. Resnapshot with
    /// [`panes`](Self::panes) and continue from [`version`](Self::version).
    pub fn changes_since(&self, since: ProjectionVersion) -> Option<Vec<ProjectionChange>> {
        if since < self.trimmed_through {
            return None;
        }
        Some(
            self.changes
                .iter()
                .filter(|c| c.version > since)
                .cloned()
                .collect(),
        )
    }

    fn record(&mut self, pane_id: &PaneId, kind: ChangeKind) {
        self.version += 1;
        if self.changes.len() == self.change_capacity {
            if let Some(dropped) = self.changes.pop_front() {
                self.trimmed_through = dropped.version;
            }
        }
        self.changes.push_back(ProjectionChange {
            version: self.version,
            pane_id: pane_id.clone(),
            kind,
        });
    }

    // ── Bindings ──

    /// Record the canonical root of a worktree; used to relativize cwds.
    pub fn set_worktree_root(&mut self, worktree_id: WorktreeId, root: PathBuf) {
        self.worktree_roots.insert(worktree_id, root);
    }

    pub fn forget_worktree(&mut self, worktree_id: &WorktreeId) {
        self.worktree_roots.remove(worktree_id);
    }

    /// Bind (or rebind) a pane. A pane moved to another worktree starts
    /// from an empty view.
    pub fn bind_pane(&mut self, pane_id: PaneId, worktree_id: WorktreeId, cwd: Option<PathBuf>) {
        let entry = self
            .panes
            .entry(pane_id.clone())
            .or_insert_with(|| PaneProjection::new(pane_id.clone(), worktree_id.clone()));
        if entry.worktree_id != worktree_id {
            *entry = PaneProjection::new(pane_id.clone(), worktree_id);
        }
        entry.cwd = cwd;
        self.record(&pane_id, ChangeKind::Binding);
    }

    pub fn unbind_pane(&mut self, pane_id: &PaneId) -> Option<PaneProjection> {
        let removed = self.panes.remove(pane_id)?;
        self.record(pane_id, ChangeKind::Binding);
        Some(removed)
    }

    pub fn scope_of(&self, pane: &PaneProjection) -> Scope {
        let Some(cwd) = &pane.cwd else {
            return Scope::Whole;
        };
        if cwd.is_relative() {
            return if cwd.as_os_str().is_empty() {
                Scope::Whole
            } else {
                Scope::Subtree(cwd.clone())
            };
        }
        let Some(root) = self.worktree_roots.get(&pane.worktree_id) else {
            return Scope::Unresolved;
        };
        match cwd.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => Scope::Whole,
            Ok(rel) => Scope::Subtree(rel.to_path_buf()),
            Err(_) => Scope::Unresolved,
        }
    }

    // ── Events ──

    /// Apply one envelope. Anything that is not a filesystem-sourced envelope
    /// with a worktree facet is ignored.
    pub fn apply(&mut self, envelope: &PaneEventEnvelope) -> ApplyResult {
        let mut result = ApplyResult::default();
        if !envelope.source().is_filesystem() {
            return result;
        }
        let Some(worktree_id) = envelope.source_facets().worktree_id.clone() else {
            return result;
        };
        let PaneEvent::Filesystem(event) = envelope.event() else {
            return result;
        };
        let bound: Vec<PaneId> = self
            .panes
            .values()
            .filter(|p| p.worktree_id == worktree_id)
            .map(|p| p.pane_id.clone())
            .collect();

        for pane_id in bound {
            let changed = match event {
                FilesystemEvent::FilesChanged(changeset) => {
                    match self.apply_changeset(&pane_id, changeset) {
                        Some(changed) => changed.then_some(ChangeKind::Files),
                        None => {
                            result.stale_dropped += 1;
                            None
                        }
                    }
                }
                FilesystemEvent::GitStatusChanged { counts, .. } => self
                    .panes
                    .get_mut(&pane_id)
                    .filter(|p| p.status != Some(*counts))
                    .map(|p| {
                        p.status = Some(*counts);
                        ChangeKind::Status
                    }),
                FilesystemEvent::BranchChanged { branch, .. } => self
                    .panes
                    .get_mut(&pane_id)
                    .filter(|p| p.branch != *branch)
                    .map(|p| {
                        p.branch = branch.clone();
                        ChangeKind::Branch
                    }),
            };
            if let Some(kind) = changed {
                if let Some(p) = self.panes.get_mut(&pane_id) {
                    p.updated_at_ms = envelope.timestamp_ms();
                }
                self.record(&pane_id, kind);
                result.panes_changed += 1;
            }
        }
        result
    }

    /// `None` if stale; otherwise whether the visible path set changed.
    fn apply_changeset(&mut self, pane_id: &PaneId, changeset: &FileChangeset) -> Option<bool> {
        let scope = self.scope_of(self.panes.get(pane_id)?);
        let pane = self.panes.get_mut(pane_id)?;
        if changeset.batch_seq <= pane.last_batch_seq {
            debug!(
                pane_id = %pane_id,
                batch_seq = changeset.batch_seq,
                cursor = pane.last_batch_seq,
                "dropping stale changeset"
            );
            return None;
        }
        pane.last_batch_seq = changeset.batch_seq;
        if changeset.part <= 1 {
            pane.pending_reset = true;
        }

        let visible: BTreeSet<PathBuf> = changeset
            .paths
            .iter()
            .filter(|p| scope.admits(p))
            .cloned()
            .collect();
        if visible.is_empty() {
            return Some(false);
        }
        if std::mem::take(&mut pane.pending_reset) {
            pane.changed_paths = visible;
        } else {
            pane.changed_paths.extend(visible);
        }
        Some(true)
    }
}
