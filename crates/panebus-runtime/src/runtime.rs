//! One live pane: lifecycle, metadata, backend and its event stream.
//!
//! All mutable state sits behind a single async mutex. Envelopes are stamped,
//! recorded in the replay buffer and broadcast while that lock is held, so
//! every consumer observes one pane's envelopes in `seq` order.
//!
//! Subscriptions are forwarding tasks owned by the runtime. Each one ends
//! after delivering the envelope that moves the pane to `terminated`;
//! [`PaneRuntime::shutdown`] waits for them (bounded by its timeout) before
//! returning.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use panebus_core::event::LifecycleEvent;
use panebus_core::lifecycle::Transition;
use panebus_core::types::{
    CommandId, CorrelationId, PaneKind, PaneMetadata, ResourceId, SourceSequencer, Stamp,
};
use panebus_core::{
    CapabilitySet, Clock, CommandAck, CommandError, EventSource, LifecycleState, PaneCommand,
    PaneEvent, PaneEventEnvelope, PaneId, Recovery, ReplayBuffer, ReplayResult,
    RuntimeCommandEnvelope, SourceFacets,
};

use crate::backend::{BackendError, PaneBackend};
use crate::bus::EventBus;

/// Per-subscription queue depth between the forwarding task and the consumer.
const STREAM_BUFFER: usize = 64;

// ─── Stream ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(Arc<PaneEventEnvelope>),
    /// The subscription fell behind further than the replay buffer reaches.
    /// Resnapshot, then continue from `last_seq`.
    Resync { epoch: u64, last_seq: u64 },
}

/// Ordered event stream of one runtime. Finite only once the runtime has
/// terminated.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamItem>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }

    /// Next envelope, skipping resync markers.
    pub async fn next_event(&mut self) -> Option<Arc<PaneEventEnvelope>> {
        loop {
            match self.rx.recv().await? {
                StreamItem::Event(envelope) => return Some(envelope),
                StreamItem::Resync { .. } => continue,
            }
        }
    }
}

// ─── Snapshot ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    pub pane_id: PaneId,
    pub kind: PaneKind,
    pub lifecycle: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub metadata: PaneMetadata,
    pub capabilities: CapabilitySet,
    pub epoch: u64,
    pub last_seq: u64,
}

// ─── Runtime ──────────────────────────────────────────────────────

#[derive(Debug)]
struct RuntimeInner {
    lifecycle: panebus_core::Lifecycle,
    metadata: PaneMetadata,
    sequencer: SourceSequencer,
    replay: ReplayBuffer,
    backend: Box<dyn PaneBackend>,
    released: bool,
}

#[derive(Debug)]
pub struct PaneRuntime {
    pane_id: PaneId,
    kind: PaneKind,
    capabilities: CapabilitySet,
    inner: Arc<Mutex<RuntimeInner>>,
    live: broadcast::Sender<Arc<PaneEventEnvelope>>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    subscriptions: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

/// Stamps, records and broadcasts one event. Must be called with the inner
/// lock held.
struct Emitter<'a> {
    pane_id: &'a PaneId,
    live: &'a broadcast::Sender<Arc<PaneEventEnvelope>>,
    bus: &'a EventBus,
    now_ms: u64,
    command_id: Option<&'a CommandId>,
    correlation_id: Option<&'a CorrelationId>,
    emitted: Vec<u64>,
}

impl Emitter<'_> {
    fn emit(&mut self, inner: &mut RuntimeInner, event: PaneEvent) {
        let stamp = inner.sequencer.next_stamp();
        let facets = match &inner.metadata.worktree_id {
            Some(worktree_id) => SourceFacets::for_worktree(worktree_id.clone()),
            None => SourceFacets::none(),
        };
        let envelope = Arc::new(
            PaneEventEnvelope::new(EventSource::Pane(self.pane_id.clone()), stamp, self.now_ms, event)
                .with_facets(facets)
                .with_command(self.command_id.cloned(), self.correlation_id.cloned()),
        );
        if let Err(e) = inner.replay.append(Arc::clone(&envelope)) {
            warn!(pane_id = %self.pane_id, error = %e, "replay append rejected");
        }
        if self.live.send(Arc::clone(&envelope)).is_err() {
            trace!(pane_id = %self.pane_id, seq = stamp.seq, "no live subscribers");
        }
        self.bus.publish(envelope);
        self.emitted.push(stamp.seq);
    }

    fn transition(&mut self, inner: &mut RuntimeInner, transition: Transition) {
        self.emit(
            inner,
            PaneEvent::Lifecycle(LifecycleEvent::StateChanged {
                from: transition.from,
                to: transition.to,
            }),
        );
    }
}

impl PaneRuntime {
    /// Build a runtime in `created`. Nothing is emitted until [`start`](Self::start).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pane_id: PaneId,
        backend: Box<dyn PaneBackend>,
        metadata: PaneMetadata,
        capabilities: CapabilitySet,
        epoch: u64,
        replay_capacity: usize,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let kind = backend.kind();
        let (live, _) = broadcast::channel(replay_capacity.max(1));
        let inner = RuntimeInner {
            lifecycle: panebus_core::Lifecycle::new(),
            metadata,
            sequencer: SourceSequencer::new(epoch),
            replay: ReplayBuffer::new(EventSource::Pane(pane_id.clone()), replay_capacity),
            backend,
            released: false,
        };
        Arc::new(Self {
            pane_id,
            kind,
            capabilities,
            inner: Arc::new(Mutex::new(inner)),
            live,
            bus,
            clock,
            subscriptions: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn pane_id(&self) -> &PaneId {
        &self.pane_id
    }

    pub fn kind(&self) -> PaneKind {
        self.kind
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    fn emitter<'a>(&'a self, command: Option<&'a RuntimeCommandEnvelope>) -> Emitter<'a> {
        Emitter {
            pane_id: &self.pane_id,
            live: &self.live,
            bus: &self.bus,
            now_ms: self.clock.now_ms(),
            command_id: command.map(|c| &c.command_id),
            correlation_id: command.and_then(|c| c.correlation_id.as_ref()),
            emitted: Vec::new(),
        }
    }

    /// Start the backend and move to `ready`. A backend start failure
    /// terminates the runtime and is returned as [`CommandError::Backend`].
    pub async fn start(&self) -> Result<(), CommandError> {
        let mut inner = self.inner.lock().await;
        let mut emitter = self.emitter(None);
        let metadata = inner.metadata.clone();
        match inner.backend.start(&metadata) {
            Ok(events) => {
                let transition = inner.lifecycle.mark_ready().map_err(|e| {
                    CommandError::Validation(format!("cannot start {}: {e}", self.pane_id))
                })?;
                emitter.transition(&mut inner, transition);
                for event in events {
                    emitter.emit(&mut inner, event);
                }
                info!(pane_id = %self.pane_id, kind = %self.kind, epoch = inner.sequencer.epoch(), "runtime ready");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail_locked(&mut inner, &mut emitter, &reason);
                Err(CommandError::Backend {
                    pane_id: self.pane_id.clone(),
                    reason,
                })
            }
        }
    }

    fn fail_locked(&self, inner: &mut RuntimeInner, emitter: &mut Emitter<'_>, reason: &str) {
        if let Some(transition) = inner.lifecycle.fail(reason) {
            warn!(pane_id = %self.pane_id, reason, "runtime failed");
            emitter.emit(
                inner,
                PaneEvent::Lifecycle(LifecycleEvent::Failed {
                    reason: reason.to_string(),
                }),
            );
            emitter.transition(inner, transition);
        }
    }

    /// Validate and apply one command.
    ///
    /// Checks run in a fixed order: target, capability, lifecycle, payload.
    /// A rejected command emits nothing. On success the ack lists the `seq`
    /// of every envelope the command produced.
    pub async fn handle_command(
        &self,
        command: &RuntimeCommandEnvelope,
    ) -> Result<CommandAck, CommandError> {
        if command.target_pane_id != self.pane_id {
            return Err(CommandError::Validation(format!(
                "command {} targets {}, not {}",
                command.command_id, command.target_pane_id, self.pane_id
            )));
        }
        let kind = command.command.kind();
        if !self.capabilities.contains(kind) {
            debug!(pane_id = %self.pane_id, kind = %kind, "capability denied");
            return Err(CommandError::CapabilityDenied {
                pane_id: self.pane_id.clone(),
                kind,
            });
        }

        let mut inner = self.inner.lock().await;
        let state = inner.lifecycle.state();
        if !state.accepts_commands() {
            return Err(CommandError::LifecycleClosed {
                pane_id: self.pane_id.clone(),
                state,
            });
        }

        let mut emitter = self.emitter(Some(command));

        match &command.command {
            PaneCommand::UpdateMetadata(patch) => {
                if patch.is_empty() {
                    return Err(CommandError::Validation("empty metadata patch".to_string()));
                }
                if let Some(field) = patch.conflicting_field() {
                    return Err(CommandError::Validation(format!(
                        "metadata field {field:?} both set and cleared"
                    )));
                }
                if patch.apply_to(&mut inner.metadata) {
                    let metadata = inner.metadata.clone();
                    emitter.emit(
                        &mut inner,
                        PaneEvent::Lifecycle(LifecycleEvent::MetadataChanged { metadata }),
                    );
                }
            }
            other => match inner.backend.apply(other) {
                Ok(events) => {
                    for event in events {
                        emitter.emit(&mut inner, event);
                    }
                    if !inner.backend.is_alive() {
                        info!(pane_id = %self.pane_id, "backend stopped, terminating");
                        if let Some(transition) = inner.lifecycle.terminate() {
                            emitter.transition(&mut inner, transition);
                        }
                    }
                }
                Err(BackendError::Invalid(reason)) => {
                    return Err(CommandError::Validation(reason));
                }
                Err(BackendError::Fatal(reason)) => {
                    self.fail_locked(&mut inner, &mut emitter, &reason);
                    return Err(CommandError::Backend {
                        pane_id: self.pane_id.clone(),
                        reason,
                    });
                }
            },
        }

        Ok(CommandAck {
            command_id: command.command_id.clone(),
            emitted_seqs: emitter.emitted,
        })
    }

    pub async fn snapshot(&self) -> RuntimeSnapshot {
        let inner = self.inner.lock().await;
        RuntimeSnapshot {
            pane_id: self.pane_id.clone(),
            kind: self.kind,
            lifecycle: inner.lifecycle.state(),
            failure: inner.lifecycle.failure().map(str::to_string),
            metadata: inner.metadata.clone(),
            capabilities: self.capabilities.clone(),
            epoch: inner.sequencer.epoch(),
            last_seq: inner.sequencer.last_seq(),
        }
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        self.inner.lock().await.lifecycle.state()
    }

    pub async fn metadata(&self) -> PaneMetadata {
        self.inner.lock().await.metadata.clone()
    }

    /// Retained envelopes with `seq > from_seq` in the current epoch.
    pub async fn events_since(&self, from_seq: u64) -> ReplayResult {
        self.inner.lock().await.replay.replay(from_seq)
    }

    /// Like [`events_since`](Self::events_since), but a stale `epoch` is
    /// reported as a gap.
    pub async fn events_since_epoch(&self, epoch: u64, from_seq: u64) -> ReplayResult {
        self.inner.lock().await.replay.replay_from(epoch, from_seq)
    }

    /// Retained envelopes after `cursor`, for a bus consumer that lagged.
    pub async fn recover(&self, cursor: Option<Stamp>) -> Recovery {
        self.inner.lock().await.replay.recover(cursor)
    }

    /// Live stream from now on.
    pub async fn subscribe(&self) -> EventStream {
        self.subscribe_from(None).await
    }

    /// Stream that first replays envelopes after `from_seq` (a gap yields a
    /// leading [`StreamItem::Resync`]) and then continues live without
    /// duplicates or holes.
    pub async fn subscribe_from(&self, from_seq: Option<u64>) -> EventStream {
        let inner = self.inner.lock().await;
        if inner.lifecycle.state().is_terminal() {
            // Replay what is left, then end. The channel holds the whole
            // backlog, so nothing needs to forward it.
            let backlog = match from_seq {
                Some(from) => initial_items(&inner.replay.replay(from), &inner),
                None => Vec::new(),
            };
            drop(inner);
            let (tx, rx) = mpsc::channel(backlog.len().max(1));
            for item in backlog {
                if tx.try_send(item).is_err() {
                    warn!(pane_id = %self.pane_id, "replay backlog did not fit the stream");
                    break;
                }
            }
            return EventStream { rx };
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let live_rx = self.live.subscribe();
        let backlog = match from_seq {
            Some(from) => initial_items(&inner.replay.replay(from), &inner),
            None => Vec::new(),
        };
        let forwarder = Forwarder {
            pane_id: self.pane_id.clone(),
            epoch: inner.sequencer.epoch(),
            last_seq: inner.sequencer.last_seq(),
            inner: Arc::clone(&self.inner),
            out: tx,
        };
        drop(inner);

        let cancel = self.cancel.child_token();
        self.subscriptions
            .lock()
            .await
            .spawn(forwarder.run(live_rx, backlog, cancel));
        EventStream { rx }
    }

    /// Drain, release backend resources and terminate.
    ///
    /// Emits `ready → draining` and `draining → terminated`, waits up to
    /// `timeout` for open subscriptions to deliver the final envelope, then
    /// cancels whatever is left. Returns the released resources; a second
    /// call returns an empty list and changes nothing.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<ResourceId> {
        let released = {
            let mut inner = self.inner.lock().await;
            if inner.released {
                return Vec::new();
            }
            inner.released = true;

            let mut emitter = self.emitter(None);
            if inner.lifecycle.state() == LifecycleState::Ready {
                if let Ok(transition) = inner.lifecycle.begin_drain() {
                    emitter.transition(&mut inner, transition);
                }
            }
            let released = inner.backend.shutdown();
            if let Some(transition) = inner.lifecycle.terminate() {
                emitter.transition(&mut inner, transition);
            }
            released
        };

        let mut subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        let drained = tokio::time::timeout(timeout, async {
            while subscriptions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pane_id = %self.pane_id, pending = subscriptions.len(), "subscriptions did not drain in time");
            self.cancel.cancel();
            subscriptions.shutdown().await;
        }
        self.cancel.cancel();

        info!(pane_id = %self.pane_id, resources = released.len(), "runtime shut down");
        released
    }
}

fn initial_items(result: &ReplayResult, inner: &RuntimeInner) -> Vec<StreamItem> {
    match result {
        ReplayResult::Events(events) => events.iter().cloned().map(StreamItem::Event).collect(),
        ReplayResult::Gap { .. } => vec![StreamItem::Resync {
            epoch: inner.sequencer.epoch(),
            last_seq: inner.sequencer.last_seq(),
        }],
    }
}

// ─── Forwarding ───────────────────────────────────────────────────

struct Forwarder {
    pane_id: PaneId,
    epoch: u64,
    /// Highest `seq` handed to the consumer (or covered by a resync).
    last_seq: u64,
    inner: Arc<Mutex<RuntimeInner>>,
    out: mpsc::Sender<StreamItem>,
}

impl Forwarder {
    async fn run(
        mut self,
        mut live: broadcast::Receiver<Arc<PaneEventEnvelope>>,
        backlog: Vec<StreamItem>,
        cancel: CancellationToken,
    ) {
        for item in backlog {
            if self.out.send(item).await.is_err() {
                return;
            }
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = live.recv() => match received {
                    Ok(envelope) => {
                        if !self.forward(envelope).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(pane_id = %self.pane_id, missed, "subscription lagged, refilling");
                        if !self.refill().await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Forward one envelope. `false` once the stream is finished.
    async fn forward(&mut self, envelope: Arc<PaneEventEnvelope>) -> bool {
        if envelope.seq() <= self.last_seq {
            return true;
        }
        self.last_seq = envelope.seq();
        let terminal = matches!(
            envelope.event(),
            PaneEvent::Lifecycle(LifecycleEvent::StateChanged {
                to: LifecycleState::Terminated,
                ..
            })
        );
        if self.out.send(StreamItem::Event(envelope)).await.is_err() {
            return false;
        }
        !terminal
    }

    async fn refill(&mut self) -> bool {
        let result = {
            let inner = self.inner.lock().await;
            inner.replay.replay_from(self.epoch, self.last_seq)
        };
        match result {
            ReplayResult::Events(events) => {
                for envelope in events {
                    if !self.forward(envelope).await {
                        return false;
                    }
                }
                true
            }
            ReplayResult::Gap { epoch, .. } => {
                let last_seq = self.inner.lock().await.sequencer.last_seq();
                self.last_seq = last_seq;
                self.out
                    .send(StreamItem::Resync { epoch, last_seq })
                    .await
                    .is_ok()
            }
        }
    }
}
