//! Event taxonomy: one closed variant set per pane kind plus the filesystem
//! domain. Each variant self-classifies as critical or lossy.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::lifecycle::LifecycleState;
use crate::types::{PaneMetadata, WorktreeId};

// ─── Pane Kinds ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    TitleChanged { title: String },
    CwdChanged { cwd: PathBuf },
    InputAccepted { bytes: usize },
    CommandStarted { command_line: String },
    Resized { cols: u16, rows: u16 },
    OutputProgress { total_lines: u64 },
    Cleared,
    Bell,
    ProcessExited { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebEvent {
    NavigationStarted { url: String },
    NavigationCompleted { url: String },
    TitleChanged { title: String },
    LoadProgress { percent: u8 },
    HistoryChanged { can_go_back: bool, can_go_forward: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiffEvent {
    FileSelected { path: PathBuf },
    HunkStaged { path: PathBuf, hunk: u32 },
    HunkUnstaged { path: PathBuf, hunk: u32 },
    CommentAdded { path: PathBuf, line: u32, body: String },
    ScrollPositionChanged { line: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeViewerEvent {
    FileOpened { path: PathBuf },
    FileClosed { path: PathBuf },
    CursorMoved { line: u32, column: u32 },
    ScrollPositionChanged { line: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    MetadataChanged {
        metadata: PaneMetadata,
    },
    Failed {
        reason: String,
    },
}

// ─── Filesystem Domain ────────────────────────────────────────────

/// One flushed batch of changed paths for a single worktree.
///
/// Paths are relative to the worktree root, deduplicated and sorted. Large
/// bursts are split into `parts` consecutive batches with increasing
/// `batch_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeset {
    pub worktree_id: WorktreeId,
    pub paths: Vec<PathBuf>,
    pub timestamp_ms: u64,
    pub batch_seq: u64,
    pub part: u32,
    pub parts: u32,
}

/// Lightweight local status counts. Never carries diff content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GitStatusCounts {
    pub changed: u32,
    pub staged: u32,
    pub untracked: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilesystemEvent {
    FilesChanged(FileChangeset),
    GitStatusChanged {
        worktree_id: WorktreeId,
        counts: GitStatusCounts,
    },
    BranchChanged {
        worktree_id: WorktreeId,
        branch: Option<String>,
    },
}

// ─── Envelope Payload ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "domain", content = "event", rename_all = "snake_case")]
pub enum PaneEvent {
    Terminal(TerminalEvent),
    Web(WebEvent),
    Diff(DiffEvent),
    CodeViewer(CodeViewerEvent),
    Lifecycle(LifecycleEvent),
    Filesystem(FilesystemEvent),
}

impl PaneEvent {
    /// Kind-level consolidation key for lossy events; `None` means critical.
    ///
    /// State-like events (progress, cursor, scroll, titles, counts) are
    /// lossy: only the latest value matters. Everything carrying a distinct
    /// fact (paths, comments, exits, lifecycle steps) is critical.
    pub fn lossy_key(&self) -> Option<&'static str> {
        match self {
            Self::Terminal(ev) => match ev {
                TerminalEvent::TitleChanged { .. } => Some("terminal.title"),
                TerminalEvent::CwdChanged { .. } => Some("terminal.cwd"),
                TerminalEvent::Resized { .. } => Some("terminal.size"),
                TerminalEvent::OutputProgress { .. } => Some("terminal.output_progress"),
                TerminalEvent::InputAccepted { .. }
                | TerminalEvent::CommandStarted { .. }
                | TerminalEvent::Cleared
                | TerminalEvent::Bell
                | TerminalEvent::ProcessExited { .. } => None,
            },
            Self::Web(ev) => match ev {
                WebEvent::TitleChanged { .. } => Some("web.title"),
                WebEvent::LoadProgress { .. } => Some("web.load_progress"),
                WebEvent::HistoryChanged { .. } => Some("web.history"),
                WebEvent::NavigationStarted { .. } | WebEvent::NavigationCompleted { .. } => None,
            },
            Self::Diff(ev) => match ev {
                DiffEvent::ScrollPositionChanged { .. } => Some("diff.scroll"),
                DiffEvent::FileSelected { .. }
                | DiffEvent::HunkStaged { .. }
                | DiffEvent::HunkUnstaged { .. }
                | DiffEvent::CommentAdded { .. } => None,
            },
            Self::CodeViewer(ev) => match ev {
                CodeViewerEvent::CursorMoved { .. } => Some("code_viewer.cursor"),
                CodeViewerEvent::ScrollPositionChanged { .. } => Some("code_viewer.scroll"),
                CodeViewerEvent::FileOpened { .. } | CodeViewerEvent::FileClosed { .. } => None,
            },
            Self::Lifecycle(ev) => match ev {
                LifecycleEvent::MetadataChanged { .. } => Some("lifecycle.metadata"),
                LifecycleEvent::StateChanged { .. } | LifecycleEvent::Failed { .. } => None,
            },
            Self::Filesystem(ev) => match ev {
                FilesystemEvent::GitStatusChanged { .. } => Some("fs.git_status"),
                FilesystemEvent::BranchChanged { .. } => Some("fs.branch"),
                FilesystemEvent::FilesChanged(_) => None,
            },
        }
    }

    pub fn is_critical(&self) -> bool {
        self.lossy_key().is_none()
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Terminal(_) => "terminal",
            Self::Web(_) => "web",
            Self::Diff(_) => "diff",
            Self::CodeViewer(_) => "code_viewer",
            Self::Lifecycle(_) => "lifecycle",
            Self::Filesystem(FilesystemEvent::FilesChanged(_)) => "files_changed",
            Self::Filesystem(FilesystemEvent::GitStatusChanged { .. }) => "git_status_changed",
            Self::Filesystem(FilesystemEvent::BranchChanged { .. }) => "branch_changed",
        }
    }

    pub fn as_changeset(&self) -> Option<&FileChangeset> {
        match self {
            Self::Filesystem(FilesystemEvent::FilesChanged(cs)) => Some(cs),
            _ => None,
        }
    }
}
