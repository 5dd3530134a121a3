//! panebus-core: envelope contract and pure scheduling primitives for the
//! pane event bus.
//!
//! Everything in this crate is deterministic: no tasks, no IO, and time only
//! enters through [`clock::Clock`] or explicit `now_ms` arguments.

pub mod clock;
pub mod command;
pub mod event;
pub mod lifecycle;
pub mod reducer;
pub mod replay;
pub mod types;
pub mod visibility;

pub use clock::{Clock, ManualClock};
pub use command::{
    CapabilitySet, CommandAck, CommandError, CommandKind, PaneCommand, RuntimeCommandEnvelope,
};
pub use event::{FileChangeset, FilesystemEvent, GitStatusCounts, PaneEvent};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use reducer::{DeliveryBatch, DeliveryGap, NotificationReducer};
pub use replay::{Recovery, ReplayBuffer, ReplayResult};
pub use types::{EventSource, PaneEventEnvelope, PaneId, SourceFacets, WorktreeId};
pub use visibility::{FocusSnapshot, VisibilityTier};
