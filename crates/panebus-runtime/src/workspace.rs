//! `WorkspaceCore`: the explicitly constructed service that owns the bus,
//! the runtime registry, the notifier, the filesystem service and the
//! projection feed.
//!
//! Nothing here is global. Every collaborator is created in
//! [`WorkspaceCore::with_parts`] and torn down in [`WorkspaceCore::shutdown`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panebus_core::types::{PaneKind, PaneMetadata, ResourceId};
use panebus_core::{
    CapabilitySet, Clock, CommandAck, CommandError, DeliveryBatch, DeliveryGap, EventSource,
    FocusSnapshot, PaneCommand, PaneId, Recovery, ReplayResult, RuntimeCommandEnvelope,
    WorktreeId,
};
use panebus_projection::{
    PaneProjection, PaneProjectionStore, ProjectionChange, ProjectionVersion,
};
use panebus_source_fs::canonical::canonicalize_changed;
use panebus_source_fs::{
    ActivityTier, FsSourceError, GitCliProbe, ReconcileReason, RegisteredRoot, StatusProbe,
};

use crate::backend::backend_for_kind;
use crate::bus::{Backfill, BusCursor, EventBus};
use crate::clock::TokioClock;
use crate::config::{ConfigError, CoreConfig};
use crate::fs_service::{FsReplay, FsService, FsServiceError};
use crate::fs_watch::WatchMode;
use crate::notifier::Notifier;
use crate::projection_feed::ProjectionFeed;
use crate::registry::{RegistryError, RuntimeRegistry};
use crate::runtime::{EventStream, PaneRuntime, RuntimeSnapshot};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Fs(#[from] FsServiceError),
}

/// Everything needed to open a pane.
#[derive(Debug, Clone)]
pub struct PaneSpec {
    pub pane_id: PaneId,
    pub kind: PaneKind,
    pub metadata: PaneMetadata,
    /// Defaults to [`CapabilitySet::for_kind`].
    pub capabilities: Option<CapabilitySet>,
}

impl PaneSpec {
    pub fn new(pane_id: impl Into<PaneId>, kind: PaneKind) -> Self {
        Self {
            pane_id: pane_id.into(),
            kind,
            metadata: PaneMetadata::default(),
            capabilities: None,
        }
    }

    pub fn with_metadata(mut self, metadata: PaneMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

/// The replay buffers behind the bus: one per registered pane plus the
/// filesystem source.
#[derive(Debug, Clone)]
struct ReplaySources {
    registry: Arc<RuntimeRegistry>,
    fs: FsReplay,
}

impl Backfill for ReplaySources {
    async fn backfill(&self, cursor: &BusCursor) -> Vec<Recovery> {
        let mut recovered = vec![self.fs.recover(cursor.last(&EventSource::filesystem()))];
        for runtime in self.registry.runtimes().await {
            let source = EventSource::Pane(runtime.pane_id().clone());
            recovered.push(runtime.recover(cursor.last(&source)).await);
        }
        recovered
    }

    async fn resync(&self, lost: &[DeliveryGap]) {
        if lost.iter().any(|gap| gap.source.is_filesystem()) {
            self.fs.resync().await;
        }
    }
}

#[derive(Debug)]
pub struct WorkspaceCore {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    registry: Arc<RuntimeRegistry>,
    notifier: Notifier,
    fs: FsService,
    projection: ProjectionFeed,
    /// pane → worktree for every bound pane. Drives root activity tiers.
    bindings: Mutex<HashMap<PaneId, WorktreeId>>,
    focus: Mutex<FocusSnapshot>,
    cancel: CancellationToken,
}

impl WorkspaceCore {
    /// Native watching and the git CLI probe. Must be called from within a
    /// tokio runtime.
    pub fn start(config: CoreConfig) -> Result<Self, WorkspaceError> {
        Self::with_parts(config, WatchMode::Native, Arc::new(GitCliProbe::default()))
    }

    pub fn with_parts(
        config: CoreConfig,
        mode: WatchMode,
        probe: Arc<dyn StatusProbe>,
    ) -> Result<Self, WorkspaceError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let bus = EventBus::new(config.bus_capacity);
        // Subscribe before anything can publish.
        let notifier_rx = bus.subscribe();
        let projection_rx = bus.subscribe();

        let fs = FsService::spawn(
            &config,
            mode,
            probe,
            bus.clone(),
            Arc::clone(&clock),
            cancel.child_token(),
        )?;
        let registry = Arc::new(RuntimeRegistry::new(config.shutdown_timeout()));
        let sources = ReplaySources {
            registry: Arc::clone(&registry),
            fs: fs.replay(),
        };
        let notifier = Notifier::spawn(
            notifier_rx,
            sources.clone(),
            Arc::clone(&clock),
            config.frame_ms,
            cancel.child_token(),
        );
        let projection = ProjectionFeed::spawn(
            projection_rx,
            sources,
            PaneProjectionStore::with_change_capacity(config.projection_change_capacity),
            cancel.child_token(),
        );
        info!(
            bus_capacity = config.bus_capacity,
            frame_ms = config.frame_ms,
            "workspace core started"
        );

        Ok(Self {
            config,
            clock,
            bus,
            registry,
            notifier,
            fs,
            projection,
            bindings: Mutex::new(HashMap::new()),
            focus: Mutex::new(FocusSnapshot::default()),
            cancel,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ─── Panes ────────────────────────────────────────────────────

    /// Create, register and start a pane. A pane whose metadata names a
    /// worktree is bound to it before it starts emitting.
    pub async fn open_pane(&self, spec: PaneSpec) -> Result<RuntimeSnapshot, WorkspaceError> {
        let PaneSpec {
            pane_id,
            kind,
            metadata,
            capabilities,
        } = spec;
        let capabilities = capabilities.unwrap_or_else(|| CapabilitySet::for_kind(kind));
        let epoch = self.registry.next_epoch(&pane_id).await;
        let runtime = PaneRuntime::new(
            pane_id.clone(),
            backend_for_kind(kind, &pane_id),
            metadata.clone(),
            capabilities,
            epoch,
            self.config.replay_capacity,
            self.bus.clone(),
            Arc::clone(&self.clock),
        );
        self.registry.register(Arc::clone(&runtime)).await?;

        if let Some(worktree_id) = metadata.worktree_id.clone() {
            if let Err(e) = self.bind(pane_id.clone(), worktree_id, metadata.cwd.clone()).await {
                self.discard(&pane_id).await;
                return Err(e);
            }
        }
        if let Err(e) = runtime.start().await {
            self.discard(&pane_id).await;
            return Err(e.into());
        }
        info!(pane_id = %pane_id, kind = %kind, epoch, "pane opened");
        Ok(runtime.snapshot().await)
    }

    async fn discard(&self, pane_id: &PaneId) {
        if let Err(e) = self.registry.close(pane_id, self.config.shutdown_timeout()).await {
            debug!(pane_id = %pane_id, error = %e, "pane already gone");
        }
        self.unbind(pane_id).await;
    }

    /// Route a command. A metadata update that moves the pane to another
    /// worktree or cwd rebinds it. A pane the command terminated, or one
    /// that failed fatally, leaves the registry and is unbound.
    pub async fn dispatch(
        &self,
        command: &RuntimeCommandEnvelope,
    ) -> Result<CommandAck, CommandError> {
        let pane_id = &command.target_pane_id;
        let before = match &command.command {
            PaneCommand::UpdateMetadata(_) => match self.registry.lookup(pane_id).await {
                Some(runtime) => Some(runtime.metadata().await),
                None => None,
            },
            _ => None,
        };

        let result = self.registry.dispatch(command).await;
        if matches!(result, Err(CommandError::UnknownPane(_))) {
            return result;
        }
        if !self.registry.contains(pane_id).await {
            // The command ended the runtime and the registry closed it.
            self.unbind(pane_id).await;
            self.sync_focused_root().await;
        } else if let (Ok(_), Some(before)) = (&result, before) {
            self.rebind_if_moved(pane_id, &before).await;
        }
        result
    }

    async fn rebind_if_moved(&self, pane_id: &PaneId, before: &PaneMetadata) {
        let Some(runtime) = self.registry.lookup(pane_id).await else {
            return;
        };
        let after = runtime.metadata().await;
        if after.worktree_id == before.worktree_id && after.cwd == before.cwd {
            return;
        }
        match after.worktree_id {
            Some(worktree_id) => {
                if let Err(e) = self.bind(pane_id.clone(), worktree_id, after.cwd).await {
                    warn!(pane_id = %pane_id, error = %e, "rebinding pane failed");
                }
            }
            None => self.unbind(pane_id).await,
        }
    }

    /// Close a pane: unregister, drain and release its resources.
    pub async fn close_pane(&self, pane_id: &PaneId) -> Result<Vec<ResourceId>, WorkspaceError> {
        let released = self
            .registry
            .close(pane_id, self.config.shutdown_timeout())
            .await?;
        self.unbind(pane_id).await;
        self.sync_focused_root().await;
        Ok(released)
    }

    pub async fn pane_snapshot(&self, pane_id: &PaneId) -> Option<RuntimeSnapshot> {
        let runtime = self.registry.lookup(pane_id).await?;
        Some(runtime.snapshot().await)
    }

    /// Ordered event stream of one pane, optionally starting with the
    /// retained envelopes after `from_seq`.
    pub async fn subscribe_pane(
        &self,
        pane_id: &PaneId,
        from_seq: Option<u64>,
    ) -> Result<EventStream, WorkspaceError> {
        let runtime = self
            .registry
            .lookup(pane_id)
            .await
            .ok_or_else(|| RegistryError::NotRegistered(pane_id.clone()))?;
        Ok(runtime.subscribe_from(from_seq).await)
    }

    pub async fn panes(&self) -> Vec<PaneId> {
        self.registry.list().await
    }

    // ─── Worktrees ────────────────────────────────────────────────

    /// Register a worktree root with the filesystem source. Returns the
    /// canonical root.
    pub async fn add_worktree(
        &self,
        worktree_id: WorktreeId,
        path: &Path,
    ) -> Result<PathBuf, WorkspaceError> {
        let tier = self.tier_for(&worktree_id).await;
        let root = self.fs.register(worktree_id.clone(), path, tier).await?;
        self.projection
            .store()
            .lock()
            .await
            .set_worktree_root(worktree_id.clone(), root.clone());
        self.sync_focused_root().await;
        info!(worktree_id = %worktree_id, root = %root.display(), "worktree added");
        Ok(root)
    }

    /// Unregister a worktree root. Bound panes stay bound but stop
    /// receiving filesystem updates.
    pub async fn remove_worktree(&self, worktree_id: &WorktreeId) -> Result<(), WorkspaceError> {
        self.fs.unregister(worktree_id.clone()).await?;
        self.projection.store().lock().await.forget_worktree(worktree_id);
        info!(worktree_id = %worktree_id, "worktree removed");
        Ok(())
    }

    pub async fn worktrees(&self) -> Result<Vec<RegisteredRoot>, WorkspaceError> {
        Ok(self.fs.roots().await?)
    }

    /// Bind a registered pane to a worktree (and optional cwd inside it)
    /// for visibility and projection purposes.
    pub async fn bind_pane(
        &self,
        pane_id: &PaneId,
        worktree_id: WorktreeId,
        cwd: Option<PathBuf>,
    ) -> Result<(), WorkspaceError> {
        if !self.registry.contains(pane_id).await {
            return Err(RegistryError::NotRegistered(pane_id.clone()).into());
        }
        self.bind(pane_id.clone(), worktree_id, cwd).await?;
        self.sync_focused_root().await;
        Ok(())
    }

    async fn bind(
        &self,
        pane_id: PaneId,
        worktree_id: WorktreeId,
        cwd: Option<PathBuf>,
    ) -> Result<(), WorkspaceError> {
        let cwd = match cwd {
            Some(path) => Some(
                tokio::task::spawn_blocking(move || canonicalize_changed(&path))
                    .await
                    .map_err(FsServiceError::from)?,
            ),
            None => None,
        };
        self.projection
            .store()
            .lock()
            .await
            .bind_pane(pane_id.clone(), worktree_id.clone(), cwd);
        self.notifier
            .bind_pane(pane_id.clone(), worktree_id.clone())
            .await;
        let previous = self
            .bindings
            .lock()
            .await
            .insert(pane_id.clone(), worktree_id.clone());
        debug!(pane_id = %pane_id, worktree_id = %worktree_id, "pane bound");

        if let Some(previous) = previous {
            if previous != worktree_id {
                self.refresh_tier(&previous).await;
            }
        }
        self.refresh_tier(&worktree_id).await;
        Ok(())
    }

    async fn unbind(&self, pane_id: &PaneId) {
        self.projection.store().lock().await.unbind_pane(pane_id);
        self.notifier.forget_pane(pane_id.clone()).await;
        let previous = self.bindings.lock().await.remove(pane_id);
        if let Some(worktree_id) = previous {
            self.refresh_tier(&worktree_id).await;
        }
    }

    async fn tier_for(&self, worktree_id: &WorktreeId) -> ActivityTier {
        let bindings = self.bindings.lock().await;
        if bindings.values().any(|w| w == worktree_id) {
            ActivityTier::ActiveInApp
        } else {
            ActivityTier::SidebarOnly
        }
    }

    async fn refresh_tier(&self, worktree_id: &WorktreeId) {
        let tier = self.tier_for(worktree_id).await;
        match self.fs.set_activity_tier(worktree_id.clone(), tier).await {
            Ok(()) => {}
            Err(FsServiceError::Source(FsSourceError::NotRegistered(_))) => {
                debug!(worktree_id = %worktree_id, "tier change for unregistered worktree");
            }
            Err(e) => warn!(worktree_id = %worktree_id, error = %e, "tier change failed"),
        }
    }

    // ─── Focus and notifications ──────────────────────────────────

    /// Replace the focus snapshot. Visibility tiers follow immediately; the
    /// focused pane's worktree root gets flush and reconcile precedence.
    pub async fn set_focus(&self, focus: FocusSnapshot) {
        *self.focus.lock().await = focus.clone();
        self.notifier.set_focus(focus).await;
        self.sync_focused_root().await;
    }

    async fn sync_focused_root(&self) {
        let focused = self.focus.lock().await.focused_pane.clone();
        let root = match focused {
            Some(pane_id) => self.bindings.lock().await.get(&pane_id).cloned(),
            None => None,
        };
        if let Err(e) = self.fs.set_focused_root(root).await {
            warn!(error = %e, "focused root update failed");
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Arc<DeliveryBatch>> {
        self.notifier.subscribe()
    }

    // ─── Projection and filesystem reads ──────────────────────────

    pub async fn projection(&self, pane_id: &PaneId) -> Option<PaneProjection> {
        self.projection.store().lock().await.snapshot(pane_id).cloned()
    }

    pub async fn projection_version(&self) -> ProjectionVersion {
        self.projection.store().lock().await.version()
    }

    /// Projection changes after `since`; `None` once the change log no
    /// longer reaches back that far and the caller must resnapshot.
    pub async fn projection_changes_since(
        &self,
        since: ProjectionVersion,
    ) -> Option<Vec<ProjectionChange>> {
        self.projection.store().lock().await.changes_since(since)
    }

    pub fn fs_events_since(&self, epoch: u64, from_seq: u64) -> ReplayResult {
        self.fs.events_since(epoch, from_seq)
    }

    pub async fn reconcile(&self, reason: ReconcileReason) -> Result<(), WorkspaceError> {
        Ok(self.fs.reconcile(reason).await?)
    }

    /// Feed changed paths without a native watcher.
    pub async fn inject_paths(&self, paths: Vec<PathBuf>) -> Result<(), WorkspaceError> {
        Ok(self.fs.inject_paths(paths).await?)
    }

    // ─── Shutdown ─────────────────────────────────────────────────

    /// Close every pane, stop the filesystem service and the projection
    /// feed, then let the notifier deliver its final batch. Both bus
    /// consumers can still refill from the replay buffers while draining.
    pub async fn shutdown(self) {
        let closed = self
            .registry
            .close_all(self.config.shutdown_timeout())
            .await;
        info!(panes = closed.len(), "panes closed");
        self.fs.shutdown().await;
        self.projection.shutdown().await;
        self.notifier.shutdown().await;
        self.cancel.cancel();
        info!("workspace core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panebus_core::command::TerminalCommand;
    use panebus_core::{LifecycleState, VisibilityTier};
    use panebus_source_fs::{StatusError, StatusReport};

    #[derive(Debug)]
    struct CleanProbe;

    impl StatusProbe for CleanProbe {
        fn probe(&self, _root: &Path) -> Result<StatusReport, StatusError> {
            Ok(StatusReport::default())
        }
    }

    fn core() -> WorkspaceCore {
        let mut config = CoreConfig::default();
        config.fs.debounce_ms = 20;
        config.fs.max_latency_ms = 100;
        WorkspaceCore::with_parts(config, WatchMode::Manual, Arc::new(CleanProbe))
            .expect("workspace core")
    }

    fn bound_to(worktree: &str) -> PaneMetadata {
        PaneMetadata {
            worktree_id: Some(WorktreeId::new(worktree)),
            ..PaneMetadata::default()
        }
    }

    fn input(id: &str, pane: &str, text: &str) -> RuntimeCommandEnvelope {
        RuntimeCommandEnvelope::new(
            id,
            pane,
            PaneCommand::Terminal(TerminalCommand::SendInput {
                text: text.to_string(),
            }),
            0,
        )
    }

    async fn tier_of(ws: &WorkspaceCore, worktree: &str) -> ActivityTier {
        ws.worktrees()
            .await
            .expect("roots")
            .into_iter()
            .find(|r| r.worktree_id == WorktreeId::new(worktree))
            .expect("registered")
            .activity_tier
    }

    #[tokio::test]
    async fn pane_ids_are_unique() {
        let ws = core();
        ws.open_pane(PaneSpec::new("p1", PaneKind::Terminal))
            .await
            .expect("open");
        let err = ws
            .open_pane(PaneSpec::new("p1", PaneKind::WebView))
            .await
            .expect_err("duplicate");
        assert!(matches!(
            err,
            WorkspaceError::Registry(RegistryError::AlreadyRegistered(_))
        ));
        assert_eq!(ws.panes().await, vec![PaneId::new("p1")]);
        ws.shutdown().await;
    }

    #[tokio::test]
    async fn closed_pane_is_unknown() {
        let ws = core();
        ws.open_pane(PaneSpec::new("p1", PaneKind::Terminal))
            .await
            .expect("open");
        let released = ws.close_pane(&PaneId::new("p1")).await.expect("close");
        assert!(!released.is_empty());
        assert_eq!(
            ws.dispatch(&input("c1", "p1", "ls")).await,
            Err(CommandError::UnknownPane(PaneId::new("p1")))
        );
        assert!(matches!(
            ws.close_pane(&PaneId::new("p1")).await,
            Err(WorkspaceError::Registry(RegistryError::NotRegistered(_)))
        ));
        ws.shutdown().await;
    }

    #[tokio::test]
    async fn focused_pane_notifications_are_p0() {
        let ws = core();
        let mut batches = ws.subscribe_notifications();
        ws.open_pane(PaneSpec::new("p1", PaneKind::Terminal))
            .await
            .expect("open");
        ws.set_focus(FocusSnapshot::focused("p1")).await;
        ws.dispatch(&input("c1", "p1", "echo hi")).await.expect("ack");

        let batch = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let batch = batches.recv().await.expect("notifier open");
                if batch
                    .notifications
                    .iter()
                    .any(|n| n.envelope.command_id().is_some())
                {
                    return batch;
                }
            }
        })
        .await
        .expect("batch");
        assert!(
            batch
                .notifications
                .iter()
                .filter(|n| n.envelope.command_id().is_some())
                .all(|n| n.tier == VisibilityTier::P0)
        );
        ws.shutdown().await;
    }

    #[tokio::test]
    async fn bound_panes_make_roots_active() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = core();
        ws.add_worktree(WorktreeId::new("W1"), dir.path())
            .await
            .expect("add");
        assert_eq!(tier_of(&ws, "W1").await, ActivityTier::SidebarOnly);

        ws.open_pane(PaneSpec::new("p1", PaneKind::CodeViewer).with_metadata(bound_to("W1")))
            .await
            .expect("open");
        assert_eq!(tier_of(&ws, "W1").await, ActivityTier::ActiveInApp);
        assert!(ws.projection(&PaneId::new("p1")).await.is_some());

        ws.close_pane(&PaneId::new("p1")).await.expect("close");
        assert_eq!(tier_of(&ws, "W1").await, ActivityTier::SidebarOnly);
        assert!(ws.projection(&PaneId::new("p1")).await.is_none());
        ws.shutdown().await;
    }

    #[tokio::test]
    async fn metadata_update_rebinds_pane() {
        use panebus_core::types::MetadataPatch;

        let ws = core();
        ws.open_pane(PaneSpec::new("p1", PaneKind::Terminal).with_metadata(bound_to("W1")))
            .await
            .expect("open");
        let patch = MetadataPatch {
            worktree_id: Some(WorktreeId::new("W2")),
            ..MetadataPatch::default()
        };
        ws.dispatch(&RuntimeCommandEnvelope::new(
            "c1",
            "p1",
            PaneCommand::UpdateMetadata(patch),
            0,
        ))
        .await
        .expect("ack");

        let projection = ws.projection(&PaneId::new("p1")).await.expect("bound");
        assert_eq!(projection.worktree_id, WorktreeId::new("W2"));
        ws.shutdown().await;
    }

    #[tokio::test]
    async fn killed_terminal_is_unbound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = core();
        ws.add_worktree(WorktreeId::new("W1"), dir.path())
            .await
            .expect("add");
        ws.open_pane(PaneSpec::new("p1", PaneKind::Terminal).with_metadata(bound_to("W1")))
            .await
            .expect("open");
        assert_eq!(tier_of(&ws, "W1").await, ActivityTier::ActiveInApp);

        ws.dispatch(&RuntimeCommandEnvelope::new(
            "c1",
            "p1",
            PaneCommand::Terminal(TerminalCommand::Kill),
            0,
        ))
        .await
        .expect("kill acked");

        assert!(ws.panes().await.is_empty());
        assert!(ws.projection(&PaneId::new("p1")).await.is_none());
        assert_eq!(tier_of(&ws, "W1").await, ActivityTier::SidebarOnly);
        assert_eq!(
            ws.dispatch(&input("c2", "p1", "ls")).await,
            Err(CommandError::UnknownPane(PaneId::new("p1")))
        );
        ws.shutdown().await;
    }

    #[tokio::test]
    async fn projection_changes_report_truncation() {
        let mut config = CoreConfig::default();
        config.projection_change_capacity = 1;
        let ws = WorkspaceCore::with_parts(config, WatchMode::Manual, Arc::new(CleanProbe))
            .expect("workspace core");
        for id in ["p1", "p2"] {
            ws.open_pane(PaneSpec::new(id, PaneKind::CodeViewer).with_metadata(bound_to("W1")))
                .await
                .expect("open");
        }
        let version = ws.projection_version().await;
        assert!(version >= 2);
        assert!(ws.projection_changes_since(0).await.is_none());
        assert_eq!(
            ws.projection_changes_since(version - 1)
                .await
                .map(|changes| changes.len()),
            Some(1)
        );
        ws.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_terminates_open_streams() {
        let ws = core();
        ws.open_pane(PaneSpec::new("p1", PaneKind::WebView))
            .await
            .expect("open");
        let mut stream = ws
            .subscribe_pane(&PaneId::new("p1"), Some(0))
            .await
            .expect("subscribe");
        ws.shutdown().await;

        let mut last_state = None;
        while let Some(envelope) = stream.next_event().await {
            if let panebus_core::PaneEvent::Lifecycle(
                panebus_core::event::LifecycleEvent::StateChanged { to, .. },
            ) = envelope.event()
            {
                last_state = Some(*to);
            }
        }
        assert_eq!(last_state, Some(LifecycleState::Terminated));
    }
}
