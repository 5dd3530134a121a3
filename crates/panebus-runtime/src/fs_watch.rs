//! Native watcher bridge.
//!
//! `notify` delivers events on its own thread. The callback reduces each
//! event to plain values (canonical changed paths, or an overflow marker)
//! and hands them to the filesystem service over a bounded channel. When
//! that channel is full the paths are dropped and the next delivered notice
//! is an [`RawNotice::Overflow`], which the service answers with a pull
//! reconciliation.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use panebus_source_fs::canonical::canonicalize_changed;

/// Raw input to the filesystem service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawNotice {
    /// Canonical absolute paths that changed.
    Paths(Vec<PathBuf>),
    /// Events were lost; state must be recomputed.
    Overflow,
}

/// How the filesystem service observes roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// Platform watcher via `notify`.
    #[default]
    Native,
    /// No watcher; paths are injected through the service handle.
    Manual,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Recursive watch registration for top-level roots.
pub trait RootWatcher: Send + std::fmt::Debug {
    fn watch(&mut self, root: &Path) -> Result<(), WatchError>;
    fn unwatch(&mut self, root: &Path) -> Result<(), WatchError>;
}

// ─── notify ───────────────────────────────────────────────────────

pub struct NotifyRootWatcher {
    watcher: RecommendedWatcher,
}

impl std::fmt::Debug for NotifyRootWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyRootWatcher").finish_non_exhaustive()
    }
}

impl NotifyRootWatcher {
    pub fn new(tx: mpsc::Sender<RawNotice>) -> Result<Self, WatchError> {
        let dropped = Arc::new(AtomicBool::new(false));
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let notice = match res {
                Ok(event) if event.need_rescan() => RawNotice::Overflow,
                Ok(event) => {
                    if event.paths.is_empty() {
                        return;
                    }
                    RawNotice::Paths(event.paths.iter().map(|p| canonicalize_changed(p)).collect())
                }
                Err(e) => {
                    warn!(error = %e, "watcher error, requesting reconciliation");
                    RawNotice::Overflow
                }
            };
            deliver(&tx, &dropped, notice);
        })
        .map_err(WatchError::Init)?;
        Ok(Self { watcher })
    }
}

/// Non-blocking hand-off from the watcher thread.
fn deliver(tx: &mpsc::Sender<RawNotice>, dropped: &AtomicBool, notice: RawNotice) {
    if dropped.swap(false, Ordering::AcqRel) && tx.try_send(RawNotice::Overflow).is_err() {
        dropped.store(true, Ordering::Release);
        return;
    }
    match tx.try_send(notice) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            dropped.store(true, Ordering::Release);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("filesystem service gone, dropping notice");
        }
    }
}

impl RootWatcher for NotifyRootWatcher {
    fn watch(&mut self, root: &Path) -> Result<(), WatchError> {
        self.watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: root.to_path_buf(),
                source,
            })
    }

    fn unwatch(&mut self, root: &Path) -> Result<(), WatchError> {
        self.watcher.unwatch(root).map_err(|source| WatchError::Watch {
            path: root.to_path_buf(),
            source,
        })
    }
}

// ─── Manual ───────────────────────────────────────────────────────

/// Watcher that observes nothing. Used with [`WatchMode::Manual`].
#[derive(Debug, Default)]
pub struct ManualWatcher {
    watched: Vec<PathBuf>,
}

impl ManualWatcher {
    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

impl RootWatcher for ManualWatcher {
    fn watch(&mut self, root: &Path) -> Result<(), WatchError> {
        self.watched.push(root.to_path_buf());
        Ok(())
    }

    fn unwatch(&mut self, root: &Path) -> Result<(), WatchError> {
        self.watched.retain(|p| p != root);
        Ok(())
    }
}
