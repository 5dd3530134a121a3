//! panebus-source-fs: the single filesystem-change ingress of the workspace.
//!
//! Pure state plus one blocking IO boundary (the status probe). Watching,
//! timers and worker threads live in the runtime crate; everything here is
//! driven by explicit `now_ms` arguments.
//!
//! Flow: raw notice → [`canonical`] → [`ownership`] (deepest root wins) →
//! [`batcher`] (debounce + latency ceiling) → `FilesChanged` envelope →
//! [`status`] probe → [`reconcile`] delta → `GitStatusChanged` / `BranchChanged`.

pub mod batcher;
pub mod canonical;
pub mod error;
pub mod ownership;
pub mod reconcile;
pub mod source;
pub mod status;

pub use batcher::BatchPolicy;
pub use error::FsSourceError;
pub use ownership::{ActivityTier, RegisteredRoot, RootTable};
pub use reconcile::ReconcileReason;
pub use source::{FilesystemSourceState, FsSourceConfig, ProbeOutcome, ProbeRequest};
pub use status::{GitCliProbe, StatusError, StatusProbe, StatusReport};
