//! Inbound command contract: envelopes, capability gating and outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::types::{CommandId, CorrelationId, MetadataPatch, PaneId, PaneKind};

// ─── Commands ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalCommand {
    SendInput { text: String },
    Resize { cols: u16, rows: u16 },
    Clear,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebCommand {
    Navigate { url: String },
    Reload,
    GoBack,
    GoForward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiffCommand {
    SelectFile { path: PathBuf },
    StageHunk { path: PathBuf, hunk: u32 },
    UnstageHunk { path: PathBuf, hunk: u32 },
    AddComment { path: PathBuf, line: u32, body: String },
    Scroll { line: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeViewerCommand {
    OpenFile { path: PathBuf },
    GoToLine { line: u32, column: u32 },
    CloseFile,
    Scroll { line: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "domain", content = "command", rename_all = "snake_case")]
pub enum PaneCommand {
    Terminal(TerminalCommand),
    Web(WebCommand),
    Diff(DiffCommand),
    CodeViewer(CodeViewerCommand),
    UpdateMetadata(MetadataPatch),
}

/// Flat command classification used for capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    TerminalInput,
    TerminalResize,
    TerminalClear,
    TerminalKill,
    WebNavigate,
    WebReload,
    WebHistory,
    DiffSelect,
    DiffStage,
    DiffComment,
    DiffScroll,
    ViewerOpen,
    ViewerNavigate,
    ViewerClose,
    UpdateMetadata,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TerminalInput => "terminal_input",
            Self::TerminalResize => "terminal_resize",
            Self::TerminalClear => "terminal_clear",
            Self::TerminalKill => "terminal_kill",
            Self::WebNavigate => "web_navigate",
            Self::WebReload => "web_reload",
            Self::WebHistory => "web_history",
            Self::DiffSelect => "diff_select",
            Self::DiffStage => "diff_stage",
            Self::DiffComment => "diff_comment",
            Self::DiffScroll => "diff_scroll",
            Self::ViewerOpen => "viewer_open",
            Self::ViewerNavigate => "viewer_navigate",
            Self::ViewerClose => "viewer_close",
            Self::UpdateMetadata => "update_metadata",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PaneCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Terminal(cmd) => match cmd {
                TerminalCommand::SendInput { .. } => CommandKind::TerminalInput,
                TerminalCommand::Resize { .. } => CommandKind::TerminalResize,
                TerminalCommand::Clear => CommandKind::TerminalClear,
                TerminalCommand::Kill => CommandKind::TerminalKill,
            },
            Self::Web(cmd) => match cmd {
                WebCommand::Navigate { .. } => CommandKind::WebNavigate,
                WebCommand::Reload => CommandKind::WebReload,
                WebCommand::GoBack | WebCommand::GoForward => CommandKind::WebHistory,
            },
            Self::Diff(cmd) => match cmd {
                DiffCommand::SelectFile { .. } => CommandKind::DiffSelect,
                DiffCommand::StageHunk { .. } | DiffCommand::UnstageHunk { .. } => {
                    CommandKind::DiffStage
                }
                DiffCommand::AddComment { .. } => CommandKind::DiffComment,
                DiffCommand::Scroll { .. } => CommandKind::DiffScroll,
            },
            Self::CodeViewer(cmd) => match cmd {
                CodeViewerCommand::OpenFile { .. } => CommandKind::ViewerOpen,
                CodeViewerCommand::GoToLine { .. } | CodeViewerCommand::Scroll { .. } => {
                    CommandKind::ViewerNavigate
                }
                CodeViewerCommand::CloseFile => CommandKind::ViewerClose,
            },
            Self::UpdateMetadata(_) => CommandKind::UpdateMetadata,
        }
    }
}

/// Inbound request addressed to one pane runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCommandEnvelope {
    pub command_id: CommandId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub target_pane_id: PaneId,
    pub command: PaneCommand,
    pub timestamp_ms: u64,
}

impl RuntimeCommandEnvelope {
    pub fn new(
        command_id: impl Into<CommandId>,
        target_pane_id: impl Into<PaneId>,
        command: PaneCommand,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            correlation_id: None,
            target_pane_id: target_pane_id.into(),
            command,
            timestamp_ms,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

// ─── Capabilities ─────────────────────────────────────────────────

/// Immutable set of command kinds a runtime accepts, fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<CommandKind>);

impl CapabilitySet {
    pub fn contains(&self, kind: CommandKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = CommandKind> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Default capabilities for a pane kind. Every kind accepts metadata updates.
    pub fn for_kind(kind: PaneKind) -> Self {
        let kinds: &[CommandKind] = match kind {
            PaneKind::Terminal => &[
                CommandKind::TerminalInput,
                CommandKind::TerminalResize,
                CommandKind::TerminalClear,
                CommandKind::TerminalKill,
            ],
            PaneKind::WebView => &[
                CommandKind::WebNavigate,
                CommandKind::WebReload,
                CommandKind::WebHistory,
            ],
            PaneKind::Diff => &[
                CommandKind::DiffSelect,
                CommandKind::DiffStage,
                CommandKind::DiffComment,
                CommandKind::DiffScroll,
            ],
            PaneKind::CodeViewer => &[
                CommandKind::ViewerOpen,
                CommandKind::ViewerNavigate,
                CommandKind::ViewerClose,
            ],
        };
        kinds
            .iter()
            .copied()
            .chain(std::iter::once(CommandKind::UpdateMetadata))
            .collect()
    }

    /// Copy with `kind` removed.
    #[must_use]
    pub fn without(&self, kind: CommandKind) -> Self {
        let mut set = self.0.clone();
        set.remove(&kind);
        Self(set)
    }
}

impl FromIterator<CommandKind> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = CommandKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ─── Outcomes ─────────────────────────────────────────────────────

/// Successful command outcome: the sequence numbers of the envelopes the
/// command emitted, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: CommandId,
    pub emitted_seqs: Vec<u64>,
}

/// Typed command failure. Rejections and validation failures are local and
/// non-fatal; `Backend` means the runtime has terminated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("pane {pane_id} does not accept {kind} commands")]
    CapabilityDenied { pane_id: PaneId, kind: CommandKind },

    #[error("pane {pane_id} is {state}; command rejected")]
    LifecycleClosed {
        pane_id: PaneId,
        state: LifecycleState,
    },

    #[error("no runtime registered for pane {0}")]
    UnknownPane(PaneId),

    #[error("invalid command: {0}")]
    Validation(String),

    #[error("backend failure on pane {pane_id}: {reason}")]
    Backend { pane_id: PaneId, reason: String },
}

impl CommandError {
    /// Capability or lifecycle rejection (as opposed to a failure).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CapabilityDenied { .. } | Self::LifecycleClosed { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}
