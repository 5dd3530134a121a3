//! Shared event bus: one broadcast channel carrying every envelope.
//!
//! Publishers never block. A receiver that falls more than `capacity`
//! envelopes behind observes `RecvError::Lagged` and must recover from the
//! per-source replay buffers through a [`Backfill`]. A [`BusCursor`] then
//! skips whatever the bus still hands it that recovery already covered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use panebus_core::types::Stamp;
use panebus_core::{DeliveryGap, EventSource, PaneEventEnvelope, Recovery};

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<PaneEventEnvelope>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish one envelope. Returns the number of receivers reached.
    pub fn publish(&self, envelope: Arc<PaneEventEnvelope>) -> usize {
        match self.tx.send(envelope) {
            Ok(n) => n,
            Err(broadcast::error::SendError(envelope)) => {
                trace!(source = %envelope.source(), seq = envelope.seq(), "no bus subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PaneEventEnvelope>> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ─── Recovery ─────────────────────────────────────────────────────

/// Last stamp one bus consumer accepted, per source.
#[derive(Debug, Clone, Default)]
pub struct BusCursor {
    seen: HashMap<EventSource, Stamp>,
}

impl BusCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `envelope` and return `true` if it is newer than anything
    /// accepted from its source so far.
    pub fn advance(&mut self, envelope: &PaneEventEnvelope) -> bool {
        let stamp = envelope.stamp();
        match self.seen.get(envelope.source()) {
            Some(last) if *last >= stamp => false,
            _ => {
                self.seen.insert(envelope.source().clone(), stamp);
                true
            }
        }
    }

    pub fn last(&self, source: &EventSource) -> Option<Stamp> {
        self.seen.get(source).copied()
    }

    pub fn forget(&mut self, source: &EventSource) {
        self.seen.remove(source);
    }
}

/// Read access to the replay buffers behind the bus.
pub trait Backfill: Send + Sync + 'static {
    /// Retained envelopes after `cursor` for every live source, plus a gap
    /// for each source that already evicted some of them.
    fn backfill(&self, cursor: &BusCursor) -> impl Future<Output = Vec<Recovery>> + Send;

    /// Ask the sources named in `lost` to republish their current state.
    fn resync(&self, lost: &[DeliveryGap]) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use panebus_core::event::TerminalEvent;
    use panebus_core::types::Stamp;
    use panebus_core::{EventSource, PaneEvent};

    fn envelope(seq: u64) -> Arc<PaneEventEnvelope> {
        Arc::new(PaneEventEnvelope::new(
            EventSource::pane("p1"),
            Stamp { epoch: 0, seq },
            0,
            PaneEvent::Terminal(TerminalEvent::Bell),
        ))
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(envelope(1)), 0);
    }

    #[tokio::test]
    async fn subscribers_see_publish_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(envelope(1));
        bus.publish(envelope(2));
        assert_eq!(rx.recv().await.expect("first").seq(), 1);
        assert_eq!(rx.recv().await.expect("second").seq(), 2);
    }

    #[tokio::test]
    async fn slow_receiver_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for seq in 1..=4 {
            bus.publish(envelope(seq));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.expect("oldest retained").seq(), 3);
    }

    #[test]
    fn cursor_skips_what_it_already_accepted() {
        let mut cursor = BusCursor::new();
        assert!(cursor.advance(&envelope(1)));
        assert!(cursor.advance(&envelope(3)));
        assert!(!cursor.advance(&envelope(2)));
        assert!(!cursor.advance(&envelope(3)));
        assert_eq!(
            cursor.last(&EventSource::pane("p1")),
            Some(Stamp { epoch: 0, seq: 3 })
        );
        let next_epoch = PaneEventEnvelope::new(
            EventSource::pane("p1"),
            Stamp { epoch: 1, seq: 1 },
            0,
            PaneEvent::Terminal(TerminalEvent::Bell),
        );
        assert!(cursor.advance(&next_epoch));
        cursor.forget(&EventSource::pane("p1"));
        assert!(cursor.last(&EventSource::pane("p1")).is_none());
    }
}
