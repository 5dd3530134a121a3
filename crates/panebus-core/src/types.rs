use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::event::PaneEvent;

// ─── Identifiers ──────────────────────────────────────────────────

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable identity of a pane. Immutable for the life of its runtime.
    PaneId
);
string_id!(
    /// Identity of a worktree registered with the filesystem source.
    WorktreeId
);
string_id!(
    /// Identity of a single inbound command.
    CommandId
);
string_id!(
    /// Links events across a multi-step chain. Opaque: no structure is
    /// assumed so that branching chains can reuse it later.
    CorrelationId
);
string_id!(
    /// Identifier of a resource released during runtime shutdown.
    ResourceId
);

// ─── Source ───────────────────────────────────────────────────────

/// Built-in system-level event origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SystemSource {
    FilesystemWatcher,
}

impl SystemSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FilesystemWatcher => "filesystem_watcher",
        }
    }
}

/// Origin identity of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventSource {
    Pane(PaneId),
    System(SystemSource),
}

impl EventSource {
    pub fn pane(id: impl Into<PaneId>) -> Self {
        Self::Pane(id.into())
    }

    pub fn filesystem() -> Self {
        Self::System(SystemSource::FilesystemWatcher)
    }

    pub fn pane_id(&self) -> Option<&PaneId> {
        match self {
            Self::Pane(id) => Some(id),
            Self::System(_) => None,
        }
    }

    pub fn is_filesystem(&self) -> bool {
        matches!(self, Self::System(SystemSource::FilesystemWatcher))
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pane(id) => write!(f, "pane:{id}"),
            Self::System(sys) => write!(f, "system:{}", sys.as_str()),
        }
    }
}

/// Auxiliary routing context for system sources. Consumers filter on these
/// instead of inspecting payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFacets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<WorktreeId>,
}

impl SourceFacets {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_worktree(worktree_id: WorktreeId) -> Self {
        Self {
            worktree_id: Some(worktree_id),
        }
    }
}

// ─── Pane Description ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneKind {
    Terminal,
    WebView,
    Diff,
    CodeViewer,
}

impl PaneKind {
    pub const ALL: [Self; 4] = [Self::Terminal, Self::WebView, Self::Diff, Self::CodeViewer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::WebView => "web_view",
            Self::Diff => "diff",
            Self::CodeViewer => "code_viewer",
        }
    }
}

impl fmt::Display for PaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable descriptive fields of a pane. Absent fields exclude the pane from
/// any grouping or derivation that depends on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneMetadata {
    pub title: Option<String>,
    pub cwd: Option<PathBuf>,
    pub worktree_id: Option<WorktreeId>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Title,
    Cwd,
    WorktreeId,
    Group,
}

/// Partial metadata update: `Some` fields are set, `clear` fields are unset.
/// A field both set and cleared is a validation failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub cwd: Option<PathBuf>,
    pub worktree_id: Option<WorktreeId>,
    pub group: Option<String>,
    #[serde(default)]
    pub clear: Vec<MetadataField>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.cwd.is_none()
            && self.worktree_id.is_none()
            && self.group.is_none()
            && self.clear.is_empty()
    }

    fn sets(&self, field: MetadataField) -> bool {
        match field {
            MetadataField::Title => self.title.is_some(),
            MetadataField::Cwd => self.cwd.is_some(),
            MetadataField::WorktreeId => self.worktree_id.is_some(),
            MetadataField::Group => self.group.is_some(),
        }
    }

    /// Field that is both set and cleared, if any.
    pub fn conflicting_field(&self) -> Option<MetadataField> {
        self.clear.iter().copied().find(|f| self.sets(*f))
    }

    /// Apply to `metadata`. Returns `true` if anything changed.
    pub fn apply_to(&self, metadata: &mut PaneMetadata) -> bool {
        let before = metadata.clone();
        for field in &self.clear {
            match field {
                MetadataField::Title => metadata.title = None,
                MetadataField::Cwd => metadata.cwd = None,
                MetadataField::WorktreeId => metadata.worktree_id = None,
                MetadataField::Group => metadata.group = None,
            }
        }
        if let Some(title) = &self.title {
            metadata.title = Some(title.clone());
        }
        if let Some(cwd) = &self.cwd {
            metadata.cwd = Some(cwd.clone());
        }
        if let Some(worktree_id) = &self.worktree_id {
            metadata.worktree_id = Some(worktree_id.clone());
        }
        if let Some(group) = &self.group {
            metadata.group = Some(group.clone());
        }
        *metadata != before
    }
}

// ─── Delivery Policy ──────────────────────────────────────────────

/// Key under which pending lossy events collapse to the most recent one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsolidationKey(String);

impl ConsolidationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsolidationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryPolicy {
    /// Delivered on the next flush, never dropped, never merged.
    Critical,
    /// Pending events with the same key collapse to the latest.
    Lossy(ConsolidationKey),
}

// ─── Sequencing ───────────────────────────────────────────────────

/// Sequence stamp assigned to one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub epoch: u64,
    pub seq: u64,
}

/// Per-source `seq`/`epoch` counter. `seq` starts at 1 within each epoch so
/// that `seq = 0` always means "from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSequencer {
    epoch: u64,
    last_seq: u64,
}

impl SourceSequencer {
    pub fn new(epoch: u64) -> Self {
        Self { epoch, last_seq: 0 }
    }

    /// Allocate the next stamp.
    pub fn next_stamp(&mut self) -> Stamp {
        self.last_seq = self.last_seq.saturating_add(1);
        Stamp {
            epoch: self.epoch,
            seq: self.last_seq,
        }
    }

    /// Start a new epoch (source lifecycle reset). Returns the new epoch.
    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch = self.epoch.saturating_add(1);
        self.last_seq = 0;
        self.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

// ─── Envelope ─────────────────────────────────────────────────────

/// The unit of bus traffic.
///
/// Fields are private: an envelope is assembled once (constructor plus the
/// consuming `with_*` methods) and is read-only afterwards. Routing identity
/// lives in `source` and `source_facets`, never in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaneEventEnvelope {
    source: EventSource,
    #[serde(default)]
    source_facets: SourceFacets,
    seq: u64,
    epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command_id: Option<CommandId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    timestamp_ms: u64,
    event: PaneEvent,
}

impl PaneEventEnvelope {
    pub fn new(source: EventSource, stamp: Stamp, timestamp_ms: u64, event: PaneEvent) -> Self {
        Self {
            source,
            source_facets: SourceFacets::none(),
            seq: stamp.seq,
            epoch: stamp.epoch,
            command_id: None,
            correlation_id: None,
            timestamp_ms,
            event,
        }
    }

    #[must_use]
    pub fn with_facets(mut self, facets: SourceFacets) -> Self {
        self.source_facets = facets;
        self
    }

    #[must_use]
    pub fn with_command(
        mut self,
        command_id: Option<CommandId>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        self.command_id = command_id;
        self.correlation_id = correlation_id;
        self
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    pub fn source_facets(&self) -> &SourceFacets {
        &self.source_facets
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stamp(&self) -> Stamp {
        Stamp {
            epoch: self.epoch,
            seq: self.seq,
        }
    }

    pub fn command_id(&self) -> Option<&CommandId> {
        self.command_id.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn event(&self) -> &PaneEvent {
        &self.event
    }

    /// Delivery policy derived from the event kind. Lossy keys are scoped by
    /// source and worktree facet so unrelated streams never collapse together.
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        match self.event.lossy_key() {
            None => DeliveryPolicy::Critical,
            Some(kind_key) => {
                let key = match &self.source_facets.worktree_id {
                    Some(worktree) => format!("{}/{}/{}", self.source, worktree, kind_key),
                    None => format!("{}/{}", self.source, kind_key),
                };
                DeliveryPolicy::Lossy(ConsolidationKey(key))
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
