//! Bus subscriber that keeps the pane projection store current.
//!
//! After a lagged receive the feed refills from the filesystem replay
//! buffer. If the buffer no longer reaches back far enough, the filesystem
//! source is asked to republish the full status of every root.

use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panebus_core::{DeliveryGap, PaneEventEnvelope};
use panebus_projection::PaneProjectionStore;

use crate::bus::{Backfill, BusCursor};

#[derive(Debug)]
pub struct ProjectionFeed {
    store: Arc<Mutex<PaneProjectionStore>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProjectionFeed {
    pub fn spawn<B: Backfill>(
        bus_rx: broadcast::Receiver<Arc<PaneEventEnvelope>>,
        backfill: B,
        store: PaneProjectionStore,
        cancel: CancellationToken,
    ) -> Self {
        let store = Arc::new(Mutex::new(store));
        let feed = Feed {
            store: Arc::clone(&store),
            cursor: BusCursor::new(),
            backfill,
        };
        let task = tokio::spawn(feed.run(bus_rx, cancel.clone()));
        Self {
            store,
            cancel,
            task,
        }
    }

    /// Shared handle to the store. Bindings are written through it; the feed
    /// task is the only writer of event-driven state.
    pub fn store(&self) -> &Arc<Mutex<PaneProjectionStore>> {
        &self.store
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "projection feed ended abnormally");
        }
    }
}

struct Feed<B> {
    store: Arc<Mutex<PaneProjectionStore>>,
    cursor: BusCursor,
    backfill: B,
}

impl<B: Backfill> Feed<B> {
    async fn run(
        mut self,
        mut bus_rx: broadcast::Receiver<Arc<PaneEventEnvelope>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = bus_rx.recv() => match received {
                    Ok(envelope) => self.accept(&envelope).await,
                    Err(RecvError::Lagged(missed)) => self.recover(missed).await,
                    Err(RecvError::Closed) => break,
                },
            }
        }
        loop {
            match bus_rx.try_recv() {
                Ok(envelope) => self.accept(&envelope).await,
                Err(TryRecvError::Lagged(missed)) => self.recover(missed).await,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        let version = self.store.lock().await.version();
        info!(version, "projection feed stopped");
    }

    async fn accept(&mut self, envelope: &PaneEventEnvelope) {
        if !envelope.source().is_filesystem() || !self.cursor.advance(envelope) {
            return;
        }
        let result = self.store.lock().await.apply(envelope);
        if result.stale_dropped > 0 {
            debug!(
                seq = envelope.seq(),
                stale = result.stale_dropped,
                "stale changeset ignored by some panes"
            );
        }
    }

    async fn recover(&mut self, missed: u64) {
        warn!(missed, "projection feed lagged behind the bus, refilling from replay");
        let recovered = self.backfill.backfill(&self.cursor).await;
        let mut lost: Vec<DeliveryGap> = Vec::new();
        for recovery in recovered {
            for envelope in &recovery.events {
                self.accept(envelope).await;
            }
            if let Some(gap) = recovery.lost {
                if gap.source.is_filesystem() {
                    lost.push(gap);
                }
            }
        }
        if !lost.is_empty() {
            warn!(gaps = lost.len(), "filesystem history lost, requesting resync");
            self.backfill.resync(&lost).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use panebus_core::types::Stamp;
    use panebus_core::{
        EventSource, FileChangeset, FilesystemEvent, GitStatusCounts, PaneEvent, PaneId, Recovery,
        ReplayBuffer, SourceFacets, WorktreeId,
    };
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Filesystem replay buffer fed alongside the bus.
    #[derive(Debug, Clone)]
    struct FsHistory {
        buffer: Arc<std::sync::Mutex<ReplayBuffer>>,
        resyncs: Arc<AtomicUsize>,
    }

    impl FsHistory {
        fn new(capacity: usize) -> Self {
            Self {
                buffer: Arc::new(std::sync::Mutex::new(ReplayBuffer::new(
                    EventSource::filesystem(),
                    capacity,
                ))),
                resyncs: Arc::default(),
            }
        }

        fn publish(&self, bus: &EventBus, envelope: Arc<PaneEventEnvelope>) {
            self.buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .append(Arc::clone(&envelope))
                .expect("append");
            bus.publish(envelope);
        }
    }

    impl Backfill for FsHistory {
        async fn backfill(&self, cursor: &BusCursor) -> Vec<Recovery> {
            let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            vec![buffer.recover(cursor.last(&EventSource::filesystem()))]
        }

        async fn resync(&self, _lost: &[DeliveryGap]) {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn_feed(bus: &EventBus, history: &FsHistory) -> ProjectionFeed {
        ProjectionFeed::spawn(
            bus.subscribe(),
            history.clone(),
            PaneProjectionStore::new(),
            CancellationToken::new(),
        )
    }

    async fn wait_until<F>(store: &Mutex<PaneProjectionStore>, mut done: F)
    where
        F: FnMut(&PaneProjectionStore) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if done(&*store.lock().await) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("projection caught up");
    }

    fn status(seq: u64, changed: u32) -> Arc<PaneEventEnvelope> {
        let event = PaneEvent::Filesystem(FilesystemEvent::GitStatusChanged {
            worktree_id: WorktreeId::new("W1"),
            counts: GitStatusCounts {
                changed,
                ..GitStatusCounts::default()
            },
        });
        Arc::new(
            PaneEventEnvelope::new(EventSource::filesystem(), Stamp { epoch: 0, seq }, 5, event)
                .with_facets(SourceFacets::for_worktree(WorktreeId::new("W1"))),
        )
    }

    fn changeset(batch_seq: u64, paths: &[&str]) -> Arc<PaneEventEnvelope> {
        let event = PaneEvent::Filesystem(FilesystemEvent::FilesChanged(FileChangeset {
            worktree_id: WorktreeId::new("W1"),
            paths: paths.iter().map(PathBuf::from).collect(),
            timestamp_ms: 5,
            batch_seq,
            part: 1,
            parts: 1,
        }));
        Arc::new(
            PaneEventEnvelope::new(
                EventSource::filesystem(),
                Stamp {
                    epoch: 0,
                    seq: batch_seq,
                },
                5,
                event,
            )
            .with_facets(SourceFacets::for_worktree(WorktreeId::new("W1"))),
        )
    }

    #[tokio::test]
    async fn bound_pane_sees_changesets() {
        let bus = EventBus::new(16);
        let history = FsHistory::new(16);
        let feed = spawn_feed(&bus, &history);
        feed.store().lock().await.bind_pane(
            PaneId::new("p1"),
            WorktreeId::new("W1"),
            None,
        );
        history.publish(&bus, changeset(1, &["a.txt"]));
        history.publish(&bus, changeset(2, &["b.txt"]));

        let store = Arc::clone(feed.store());
        wait_until(&store, |s| {
            s.snapshot(&PaneId::new("p1"))
                .is_some_and(|p| p.last_batch_seq == 2)
        })
        .await;

        let guard = store.lock().await;
        let pane = guard.snapshot(&PaneId::new("p1")).expect("bound");
        assert_eq!(
            pane.changed_paths.iter().cloned().collect::<Vec<_>>(),
            vec![PathBuf::from("b.txt")]
        );
        drop(guard);
        feed.shutdown().await;
    }

    #[tokio::test]
    async fn lagged_feed_refills_from_replay() {
        let bus = EventBus::new(2);
        let history = FsHistory::new(64);
        let mut store = PaneProjectionStore::new();
        store.bind_pane(PaneId::new("p1"), WorktreeId::new("W1"), None);
        let feed = ProjectionFeed::spawn(
            bus.subscribe(),
            history.clone(),
            store,
            CancellationToken::new(),
        );
        // Status first, then enough changesets to push it off the bus.
        history.publish(&bus, status(1, 7));
        for seq in 2..=6 {
            history.publish(&bus, changeset(seq, &["a.txt"]));
        }

        let store = Arc::clone(feed.store());
        wait_until(&store, |s| {
            s.snapshot(&PaneId::new("p1"))
                .is_some_and(|p| p.last_batch_seq == 6)
        })
        .await;
        let pane = store.lock().await.snapshot(&PaneId::new("p1")).cloned();
        assert_eq!(pane.and_then(|p| p.status).map(|c| c.changed), Some(7));
        assert_eq!(history.resyncs.load(Ordering::SeqCst), 0);
        feed.shutdown().await;
    }

    #[tokio::test]
    async fn lost_history_requests_resync() {
        let bus = EventBus::new(2);
        let history = FsHistory::new(2);
        let feed = spawn_feed(&bus, &history);
        for seq in 1..=6 {
            history.publish(&bus, changeset(seq, &["a.txt"]));
        }
        feed.shutdown().await;
        assert_eq!(history.resyncs.load(Ordering::SeqCst), 1);
    }
}
