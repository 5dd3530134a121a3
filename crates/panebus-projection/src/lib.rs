//! panebus-projection: per-pane read model over filesystem events.
//!
//! Single-threaded, deterministic, no IO. Fed from the bus like any other
//! subscriber; it never watches anything itself.

pub mod store;

pub use store::{
    ApplyResult, ChangeKind, DEFAULT_CHANGE_LOG_CAPACITY, PaneProjection, PaneProjectionStore,
    ProjectionChange, ProjectionVersion, Scope,
};
