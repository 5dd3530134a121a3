//! panebus-runtime: tokio wiring for the pane event bus.
//!
//! Owns everything that spawns tasks or touches the OS: pane runtimes and
//! their backends, the runtime registry, the notifier task, the filesystem
//! service actor with its native watcher bridge, and the projection feed.
//! [`WorkspaceCore`] assembles them into one explicitly constructed service.

pub mod backend;
pub mod bus;
pub mod clock;
pub mod config;
pub mod fs_service;
pub mod fs_watch;
pub mod notifier;
pub mod projection_feed;
pub mod registry;
pub mod runtime;
pub mod workspace;

pub use backend::{BackendError, PaneBackend, backend_for_kind};
pub use bus::{Backfill, BusCursor, EventBus};
pub use clock::TokioClock;
pub use config::{ConfigError, CoreConfig, FsConfig};
pub use fs_service::{FsReplay, FsService, FsServiceError};
pub use fs_watch::{RawNotice, WatchMode};
pub use notifier::Notifier;
pub use registry::{RegistryError, RuntimeRegistry};
pub use runtime::{EventStream, PaneRuntime, RuntimeSnapshot, StreamItem};
pub use workspace::{PaneSpec, WorkspaceCore, WorkspaceError};
