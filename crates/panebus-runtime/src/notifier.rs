//! Notifier task: feeds the bus into the frame-paced reducer and publishes
//! one [`DeliveryBatch`] per frame that has anything to deliver.
//!
//! The reducer is owned by the task. Focus and pane bindings reach it as
//! control messages, so there is never a second writer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panebus_core::{
    Clock, DeliveryBatch, EventSource, FocusSnapshot, NotificationReducer, PaneEventEnvelope,
    PaneId, WorktreeId,
};

use crate::bus::{Backfill, BusCursor};

/// Capacity of the outgoing batch channel. One batch per frame, so this is
/// several seconds of backlog at 60Hz.
const BATCH_CHANNEL_CAPACITY: usize = 256;
const CONTROL_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum Control {
    SetFocus(FocusSnapshot),
    BindPane(PaneId, WorktreeId),
    ForgetPane(PaneId),
}

#[derive(Debug)]
pub struct Notifier {
    control: mpsc::Sender<Control>,
    batches: broadcast::Sender<Arc<DeliveryBatch>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Notifier {
    /// Spawn the notifier on the current runtime. `backfill` is consulted
    /// whenever the bus receiver lags.
    pub fn spawn<B: Backfill>(
        bus_rx: broadcast::Receiver<Arc<PaneEventEnvelope>>,
        backfill: B,
        clock: Arc<dyn Clock>,
        frame_ms: u64,
        cancel: CancellationToken,
    ) -> Self {
        let (control, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (batches, _) = broadcast::channel(BATCH_CHANNEL_CAPACITY);
        let intake = Intake {
            reducer: NotificationReducer::new(frame_ms, clock.now_ms()),
            cursor: BusCursor::new(),
            backfill,
        };
        let task = tokio::spawn(run(
            intake,
            bus_rx,
            control_rx,
            batches.clone(),
            clock,
            cancel.clone(),
        ));
        Self {
            control,
            batches,
            cancel,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DeliveryBatch>> {
        self.batches.subscribe()
    }

    pub async fn set_focus(&self, focus: FocusSnapshot) {
        self.send(Control::SetFocus(focus)).await;
    }

    pub async fn bind_pane(&self, pane: PaneId, worktree: WorktreeId) {
        self.send(Control::BindPane(pane, worktree)).await;
    }

    pub async fn forget_pane(&self, pane: PaneId) {
        self.send(Control::ForgetPane(pane)).await;
    }

    async fn send(&self, control: Control) {
        if self.control.send(control).await.is_err() {
            debug!("notifier stopped, control message dropped");
        }
    }

    /// Stop the task after a final flush and wait for it.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "notifier task ended abnormally");
        }
    }
}

/// Bus intake: the reducer plus what it needs to survive a lagged receiver.
struct Intake<B> {
    reducer: NotificationReducer,
    cursor: BusCursor,
    backfill: B,
}

impl<B: Backfill> Intake<B> {
    fn accept(&mut self, envelope: Arc<PaneEventEnvelope>) {
        if self.cursor.advance(&envelope) {
            self.reducer.push(envelope);
        }
    }

    /// Refill from the replay buffers after the bus dropped `missed`
    /// envelopes. Anything no longer retained becomes a gap in the next batch.
    async fn recover(&mut self, missed: u64) {
        warn!(missed, "notifier lagged behind the bus, refilling from replay");
        let recovered = self.backfill.backfill(&self.cursor).await;
        let mut refilled = 0usize;
        for recovery in recovered {
            if let Some(gap) = recovery.lost {
                warn!(
                    source = %gap.source,
                    epoch = gap.epoch,
                    last_seq = gap.last_seq,
                    "envelopes evicted before refill"
                );
                self.reducer.record_gap(gap);
            }
            for envelope in recovery.events {
                if self.cursor.advance(&envelope) {
                    self.reducer.push(envelope);
                    refilled += 1;
                }
            }
        }
        debug!(refilled, "notifier refill done");
    }

    fn control(&mut self, control: Control) {
        match control {
            Control::SetFocus(focus) => self.reducer.set_focus(focus),
            Control::BindPane(pane, worktree) => self.reducer.bind_pane(pane, worktree),
            Control::ForgetPane(pane) => {
                self.cursor.forget(&EventSource::Pane(pane.clone()));
                self.reducer.forget_pane(&pane);
            }
        }
    }
}

async fn run<B: Backfill>(
    mut intake: Intake<B>,
    mut bus_rx: broadcast::Receiver<Arc<PaneEventEnvelope>>,
    mut control_rx: mpsc::Receiver<Control>,
    batches: broadcast::Sender<Arc<DeliveryBatch>>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let frame_ms = intake.reducer.frame_ms();
    let mut ticker = tokio::time::interval(Duration::from_millis(frame_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(frame_ms, "notifier started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = bus_rx.recv() => match received {
                Ok(envelope) => intake.accept(envelope),
                Err(RecvError::Lagged(missed)) => intake.recover(missed).await,
                Err(RecvError::Closed) => break,
            },
            Some(control) = control_rx.recv() => intake.control(control),
            _ = ticker.tick() => {
                if let Some(batch) = intake.reducer.poll(clock.now_ms()) {
                    publish(&batches, batch);
                }
            }
        }
    }

    // Deliver whatever is still pending, including envelopes already queued
    // on the bus.
    loop {
        match bus_rx.try_recv() {
            Ok(envelope) => intake.accept(envelope),
            Err(TryRecvError::Lagged(missed)) => intake.recover(missed).await,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    if intake.reducer.has_pending() {
        publish(&batches, intake.reducer.flush(clock.now_ms()));
    }
    let stats = intake.reducer.stats();
    info!(
        delivered = stats.delivered,
        coalesced = stats.coalesced,
        gaps = stats.gaps,
        flushes = stats.flushes,
        "notifier stopped"
    );
}

fn publish(batches: &broadcast::Sender<Arc<DeliveryBatch>>, batch: DeliveryBatch) {
    if batch.is_empty() {
        return;
    }
    let len = batch.len();
    let gaps = batch.gaps.len();
    if batches.send(Arc::new(batch)).is_err() {
        debug!(len, gaps, "no notification subscribers");
    }
}
