//! Filesystem service: the actor that owns [`FilesystemSourceState`].
//!
//! Everything that mutates the source state runs on this one task. Blocking
//! work (root canonicalization, watch registration, status probes) runs on
//! the blocking pool and comes back as plain values. The actor only awaits
//! those results at well-defined points and never holds a lock across them.
//!
//! Watcher notices already queued when a control request arrives are routed
//! first, under the root table that was current when they were observed.
//!
//! The replay buffer is shared with [`FsReplay`] handles so that lagged bus
//! consumers can refill from it, even after the actor has stopped.
//!
//! ```text
//!  notify thread ──RawNotice──┐
//!  FsService handle ─Request──┼──> actor ──envelopes──> replay + bus
//!  blocking pool ─ProbeOutcome┘      └──ProbeRequest──> blocking pool
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use panebus_core::types::Stamp;
use panebus_core::{
    Clock, EventSource, PaneEventEnvelope, Recovery, ReplayBuffer, ReplayResult, WorktreeId,
};
use panebus_source_fs::canonical::{canonicalize_changed, canonicalize_root};
use panebus_source_fs::source::StepOutput;
use panebus_source_fs::{
    ActivityTier, FilesystemSourceState, FsSourceError, ProbeOutcome, ProbeRequest,
    ReconcileReason, RegisteredRoot, StatusProbe,
};

use crate::bus::EventBus;
use crate::config::CoreConfig;
use crate::fs_watch::{ManualWatcher, NotifyRootWatcher, RawNotice, RootWatcher, WatchError, WatchMode};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const NOTICE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum FsServiceError {
    #[error(transparent)]
    Source(#[from] FsSourceError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("blocking worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("filesystem service has stopped")]
    Stopped,
}

#[derive(Debug)]
enum Request {
    Register {
        worktree_id: WorktreeId,
        root: PathBuf,
        tier: ActivityTier,
        reply: oneshot::Sender<Result<(), FsServiceError>>,
    },
    Unregister {
        worktree_id: WorktreeId,
        reply: oneshot::Sender<Result<RegisteredRoot, FsServiceError>>,
    },
    SetActivityTier {
        worktree_id: WorktreeId,
        tier: ActivityTier,
        reply: oneshot::Sender<Result<(), FsServiceError>>,
    },
    SetFocusedRoot(Option<WorktreeId>),
    Reconcile(ReconcileReason),
    Roots(oneshot::Sender<Vec<RegisteredRoot>>),
}

// ─── Replay handle ────────────────────────────────────────────────

/// Shared read side of the filesystem replay buffer.
#[derive(Debug, Clone)]
pub struct FsReplay {
    buffer: Arc<Mutex<ReplayBuffer>>,
    requests: mpsc::Sender<Request>,
}

impl FsReplay {
    fn with_buffer<T>(&self, read: impl FnOnce(&ReplayBuffer) -> T) -> T {
        read(&self.buffer.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Filesystem envelopes after `from_seq` in `epoch`, or a gap.
    pub fn events_since(&self, epoch: u64, from_seq: u64) -> ReplayResult {
        self.with_buffer(|b| b.replay_from(epoch, from_seq))
    }

    pub fn recover(&self, cursor: Option<Stamp>) -> Recovery {
        self.with_buffer(|b| b.recover(cursor))
    }

    /// Ask the service to republish the full status of every root.
    pub async fn resync(&self) {
        if self
            .requests
            .send(Request::Reconcile(ReconcileReason::Resync))
            .await
            .is_err()
        {
            debug!("filesystem service stopped, resync skipped");
        }
    }
}

// ─── Handle ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FsService {
    requests: mpsc::Sender<Request>,
    replay: FsReplay,
    notices: mpsc::Sender<RawNotice>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FsService {
    /// Spawn the actor. In [`WatchMode::Native`] a `notify` watcher is
    /// created up front; in [`WatchMode::Manual`] paths only arrive through
    /// [`inject_paths`](Self::inject_paths).
    pub fn spawn(
        config: &CoreConfig,
        mode: WatchMode,
        probe: Arc<dyn StatusProbe>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<Self, FsServiceError> {
        let (requests, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (notices, notices_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
        let watcher: Box<dyn RootWatcher> = match mode {
            WatchMode::Native => Box::new(NotifyRootWatcher::new(notices.clone())?),
            WatchMode::Manual => Box::new(ManualWatcher::default()),
        };
        let state = FilesystemSourceState::new(config.fs.to_source_config(), 0);
        let replay = FsReplay {
            buffer: Arc::new(Mutex::new(ReplayBuffer::new(
                EventSource::filesystem(),
                config.replay_capacity,
            ))),
            requests: requests.clone(),
        };
        let actor = Actor {
            replay: Arc::clone(&replay.buffer),
            state,
            bus,
            clock,
            probe,
            watcher: Some(watcher),
            watched: BTreeSet::new(),
            probes: JoinSet::new(),
        };
        let drift_every = config.fs.drift_sweep_interval();
        let task = tokio::spawn(actor.run(requests_rx, notices_rx, drift_every, cancel.clone()));
        info!(mode = ?mode, "filesystem service started");
        Ok(Self {
            requests,
            replay,
            notices,
            cancel,
            task,
        })
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, FsServiceError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| FsServiceError::Stopped)?;
        rx.await.map_err(|_| FsServiceError::Stopped)
    }

    /// Canonicalize `path` and register it. Returns the canonical root.
    pub async fn register(
        &self,
        worktree_id: WorktreeId,
        path: &Path,
        tier: ActivityTier,
    ) -> Result<PathBuf, FsServiceError> {
        let path = path.to_path_buf();
        let root = tokio::task::spawn_blocking(move || canonicalize_root(&path)).await??;
        let registered = root.clone();
        self.call(|reply| Request::Register {
            worktree_id,
            root,
            tier,
            reply,
        })
        .await??;
        Ok(registered)
    }

    /// Unregister a root. Its pending batch is dropped and its in-flight
    /// probe invalidated before this returns.
    pub async fn unregister(&self, worktree_id: WorktreeId) -> Result<RegisteredRoot, FsServiceError> {
        self.call(|reply| Request::Unregister { worktree_id, reply })
            .await?
    }

    pub async fn set_activity_tier(
        &self,
        worktree_id: WorktreeId,
        tier: ActivityTier,
    ) -> Result<(), FsServiceError> {
        self.call(|reply| Request::SetActivityTier {
            worktree_id,
            tier,
            reply,
        })
        .await?
    }

    pub async fn set_focused_root(&self, worktree_id: Option<WorktreeId>) -> Result<(), FsServiceError> {
        self.requests
            .send(Request::SetFocusedRoot(worktree_id))
            .await
            .map_err(|_| FsServiceError::Stopped)
    }

    /// Request a pull reconciliation of every root (wake, overflow, drift).
    pub async fn reconcile(&self, reason: ReconcileReason) -> Result<(), FsServiceError> {
        self.requests
            .send(Request::Reconcile(reason))
            .await
            .map_err(|_| FsServiceError::Stopped)
    }

    /// Feed raw changed paths as if the watcher had reported them.
    pub async fn inject_paths(&self, paths: Vec<PathBuf>) -> Result<(), FsServiceError> {
        let canonical = tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .map(|p| canonicalize_changed(p))
                .collect::<Vec<_>>()
        })
        .await?;
        self.notices
            .send(RawNotice::Paths(canonical))
            .await
            .map_err(|_| FsServiceError::Stopped)
    }

    pub async fn roots(&self) -> Result<Vec<RegisteredRoot>, FsServiceError> {
        self.call(Request::Roots).await
    }

    /// Filesystem envelopes after `from_seq`, or a gap.
    pub fn events_since(&self, epoch: u64, from_seq: u64) -> ReplayResult {
        self.replay.events_since(epoch, from_seq)
    }

    pub fn replay(&self) -> FsReplay {
        self.replay.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "filesystem service ended abnormally");
        }
    }
}

// ─── Actor ────────────────────────────────────────────────────────

struct Actor {
    state: FilesystemSourceState,
    replay: Arc<Mutex<ReplayBuffer>>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn StatusProbe>,
    /// `None` while a watch plan runs on the blocking pool.
    watcher: Option<Box<dyn RootWatcher>>,
    /// Roots with a recursive watch: exactly the top-level roots.
    watched: BTreeSet<PathBuf>,
    probes: JoinSet<ProbeOutcome>,
}

impl Actor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut notices: mpsc::Receiver<RawNotice>,
        drift_every: Duration,
        cancel: CancellationToken,
    ) {
        let mut drift = tokio::time::interval_at(tokio::time::Instant::now() + drift_every, drift_every);
        drift.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_in = self
                .state
                .next_deadline_ms()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(self.clock.now_ms())));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => {
                        while let Ok(notice) = notices.try_recv() {
                            self.handle_notice(notice);
                        }
                        self.handle(request).await;
                    }
                    None => break,
                },
                Some(notice) = notices.recv() => self.handle_notice(notice),
                Some(joined) = self.probes.join_next(), if !self.probes.is_empty() => match joined {
                    Ok(outcome) => {
                        let step = self.state.apply_status(outcome, self.clock.now_ms());
                        self.publish(step);
                    }
                    Err(e) => error!(error = %e, "status probe task failed"),
                },
                _ = tokio::time::sleep(flush_in.unwrap_or_default()), if flush_in.is_some() => {
                    let step = self.state.flush_due(self.clock.now_ms());
                    self.publish(step);
                }
                _ = drift.tick() => {
                    debug!("drift sweep");
                    let probes = self.state.request_reconcile_all(ReconcileReason::DriftSweep);
                    self.spawn_probes(probes);
                }
            }
        }

        self.probes.abort_all();
        info!(roots = self.state.roots().count(), "filesystem service stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Register {
                worktree_id,
                root,
                tier,
                reply,
            } => {
                let result = self.register(worktree_id, root, tier).await;
                let _ = reply.send(result);
            }
            Request::Unregister { worktree_id, reply } => {
                let result = self.state.unregister(&worktree_id).map_err(FsServiceError::from);
                if result.is_ok() {
                    if let Err(e) = self.sync_watches().await {
                        warn!(worktree_id = %worktree_id, error = %e, "watch update failed");
                    }
                }
                let _ = reply.send(result);
            }
            Request::SetActivityTier {
                worktree_id,
                tier,
                reply,
            } => {
                let _ = reply.send(
                    self.state
                        .set_activity_tier(&worktree_id, tier)
                        .map_err(FsServiceError::from),
                );
            }
            Request::SetFocusedRoot(worktree_id) => self.state.set_focused_root(worktree_id),
            Request::Reconcile(reason) => {
                info!(reason = %reason, "reconciling all roots");
                let probes = self.state.request_reconcile_all(reason);
                self.spawn_probes(probes);
            }
            Request::Roots(reply) => {
                let _ = reply.send(self.state.roots().cloned().collect());
            }
        }
    }

    async fn register(
        &mut self,
        worktree_id: WorktreeId,
        root: PathBuf,
        tier: ActivityTier,
    ) -> Result<(), FsServiceError> {
        let probe = self.state.register(worktree_id.clone(), root, tier)?;
        if let Err(e) = self.sync_watches().await {
            let _ = self.state.unregister(&worktree_id);
            return Err(e.into());
        }
        info!(worktree_id = %worktree_id, tier = tier.as_str(), "root registered");
        self.spawn_probes([probe]);
        Ok(())
    }

    fn handle_notice(&mut self, notice: RawNotice) {
        match notice {
            RawNotice::Paths(paths) => {
                let stats = self.state.ingest(paths, self.clock.now_ms());
                if stats.unowned > 0 {
                    debug!(unowned = stats.unowned, "ignored paths outside every root");
                }
            }
            RawNotice::Overflow => {
                warn!("watcher overflow, reconciling all roots");
                let probes = self.state.request_reconcile_all(ReconcileReason::Overflow);
                self.spawn_probes(probes);
            }
        }
    }

    fn publish(&mut self, step: StepOutput) {
        for envelope in step.envelopes {
            let envelope: Arc<PaneEventEnvelope> = Arc::new(envelope);
            // Append before publishing: whatever a bus consumer can miss is
            // already in the buffer it refills from.
            let appended = self
                .replay
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .append(Arc::clone(&envelope));
            if let Err(e) = appended {
                warn!(error = %e, "filesystem replay append rejected");
            }
            self.bus.publish(envelope);
        }
        self.spawn_probes(step.probes);
    }

    fn spawn_probes(&mut self, requests: impl IntoIterator<Item = ProbeRequest>) {
        for request in requests {
            let probe = Arc::clone(&self.probe);
            debug!(worktree_id = %request.worktree_id, reason = %request.reason, "status probe");
            self.probes.spawn_blocking(move || {
                let result = probe.probe(&request.root_path);
                ProbeOutcome::for_request(&request, result)
            });
        }
    }

    /// Watch exactly the roots that have no registered ancestor.
    async fn sync_watches(&mut self) -> Result<(), WatchError> {
        let desired: BTreeSet<PathBuf> = self
            .state
            .roots()
            .filter(|r| r.parent.is_none())
            .map(|r| r.root_path.clone())
            .collect();
        let remove: Vec<PathBuf> = self.watched.difference(&desired).cloned().collect();
        let add: Vec<PathBuf> = desired.difference(&self.watched).cloned().collect();
        if remove.is_empty() && add.is_empty() {
            return Ok(());
        }
        let Some(mut watcher) = self.watcher.take() else {
            return Ok(());
        };

        // Unwatch before watching: a nested root may be watched through its
        // new ancestor only after its own watch is gone.
        let joined = tokio::task::spawn_blocking(move || {
            for path in &remove {
                if let Err(e) = watcher.unwatch(path) {
                    warn!(error = %e, "unwatch failed");
                }
            }
            let mut added = Vec::new();
            let mut failed = None;
            for path in add {
                match watcher.watch(&path) {
                    Ok(()) => added.push(path),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            (watcher, remove, added, failed)
        })
        .await;

        match joined {
            Ok((watcher, removed, added, failed)) => {
                self.watcher = Some(watcher);
                for path in &removed {
                    self.watched.remove(path);
                }
                self.watched.extend(added);
                failed.map_or(Ok(()), Err)
            }
            Err(e) => {
                error!(error = %e, "watch update panicked, watcher disabled");
                Ok(())
            }
        }
    }
}
