//! Frame-paced notification reducer.
//!
//! Envelopes are queued as they arrive and released in batches once per
//! frame. Critical envelopes are kept in arrival order; lossy envelopes live
//! in a keyed map so that a newer envelope with the same consolidation key
//! replaces the pending one. Every flush drains everything: visibility tiers
//! decide the order inside a batch, never whether an envelope is delivered.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{
    ConsolidationKey, DeliveryPolicy, EventSource, PaneEventEnvelope, PaneId, WorktreeId,
};
use crate::visibility::{FocusSnapshot, VisibilityResolver, VisibilityTier};

// ─── Constants ────────────────────────────────────────────────────

/// One display frame at 60Hz.
pub const DEFAULT_FRAME_MS: u64 = 16;

// ─── Output ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub tier: VisibilityTier,
    pub envelope: Arc<PaneEventEnvelope>,
}

/// Envelopes of `source` up to `last_seq` in `epoch` could not be delivered.
/// The consumer should resnapshot that source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryGap {
    pub source: EventSource,
    pub epoch: u64,
    pub last_seq: u64,
}

/// Result of one flush: tier-ordered, then arrival-ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryBatch {
    pub flushed_at_ms: u64,
    pub notifications: Vec<Notification>,
    /// Lossy envelopes superseded during this cycle.
    pub coalesced: u64,
    /// Sources whose envelopes were lost upstream since the last flush.
    pub gaps: Vec<DeliveryGap>,
}

impl DeliveryBatch {
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.gaps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReducerStats {
    pub pushed: u64,
    pub delivered: u64,
    pub coalesced: u64,
    pub flushes: u64,
    pub gaps: u64,
}

// ─── Reducer ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Pending {
    arrival: u64,
    envelope: Arc<PaneEventEnvelope>,
}

#[derive(Debug)]
pub struct NotificationReducer {
    frame_ms: u64,
    last_flush_ms: u64,
    next_arrival: u64,
    critical: Vec<Pending>,
    lossy: HashMap<ConsolidationKey, Pending>,
    coalesced_pending: u64,
    gaps: Vec<DeliveryGap>,
    resolver: VisibilityResolver,
    stats: ReducerStats,
}

impl NotificationReducer {
    /// `frame_ms` is clamped to at least 1. The first frame starts at `now_ms`.
    pub fn new(frame_ms: u64, now_ms: u64) -> Self {
        Self {
            frame_ms: frame_ms.max(1),
            last_flush_ms: now_ms,
            next_arrival: 0,
            critical: Vec::new(),
            lossy: HashMap::new(),
            coalesced_pending: 0,
            gaps: Vec::new(),
            resolver: VisibilityResolver::new(),
            stats: ReducerStats::default(),
        }
    }

    pub fn frame_ms(&self) -> u64 {
        self.frame_ms
    }

    pub fn stats(&self) -> ReducerStats {
        self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.critical.len() + self.lossy.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_len() > 0 || !self.gaps.is_empty()
    }

    // ── Visibility inputs ──

    pub fn set_focus(&mut self, focus: FocusSnapshot) {
        self.resolver.set_focus(focus);
    }

    pub fn bind_pane(&mut self, pane: PaneId, worktree: WorktreeId) {
        self.resolver.bind_pane(pane, worktree);
    }

    pub fn forget_pane(&mut self, pane: &PaneId) {
        self.resolver.forget_pane(pane);
    }

    pub fn resolver(&self) -> &VisibilityResolver {
        &self.resolver
    }

    // ── Queueing ──

    /// Queue an envelope under its own delivery policy.
    pub fn push(&mut self, envelope: Arc<PaneEventEnvelope>) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.stats.pushed += 1;
        let pending = Pending { arrival, envelope };
        match pending.envelope.delivery_policy() {
            DeliveryPolicy::Critical => self.critical.push(pending),
            DeliveryPolicy::Lossy(key) => {
                if self.lossy.insert(key, pending).is_some() {
                    self.coalesced_pending += 1;
                }
            }
        }
    }

    /// Report lost envelopes in the next batch. A later gap for the same
    /// source replaces an earlier one.
    pub fn record_gap(&mut self, gap: DeliveryGap) {
        self.gaps.retain(|g| g.source != gap.source);
        self.gaps.push(gap);
    }

    // ── Flushing ──

    pub fn next_flush_at(&self) -> u64 {
        self.last_flush_ms.saturating_add(self.frame_ms)
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.has_pending() && now_ms >= self.next_flush_at()
    }

    /// Flush if a frame has elapsed and anything is pending.
    pub fn poll(&mut self, now_ms: u64) -> Option<DeliveryBatch> {
        if self.is_due(now_ms) {
            Some(self.flush(now_ms))
        } else {
            None
        }
    }

    /// Drain every pending envelope regardless of pacing. Tiers are resolved
    /// against the focus state at flush time.
    pub fn flush(&mut self, now_ms: u64) -> DeliveryBatch {
        let mut pending: Vec<Pending> = std::mem::take(&mut self.critical);
        pending.extend(self.lossy.drain().map(|(_, p)| p));

        let mut notifications: Vec<(u64, Notification)> = pending
            .into_iter()
            .map(|p| {
                let tier = self.resolver.tier_for_envelope(&p.envelope);
                (
                    p.arrival,
                    Notification {
                        tier,
                        envelope: p.envelope,
                    },
                )
            })
            .collect();
        notifications.sort_by_key(|(arrival, n)| (n.tier, *arrival));

        let coalesced = std::mem::take(&mut self.coalesced_pending);
        let gaps = std::mem::take(&mut self.gaps);
        self.last_flush_ms = now_ms;
        self.stats.flushes += 1;
        self.stats.gaps += gaps.len() as u64;
        self.stats.coalesced += coalesced;
        self.stats.delivered += notifications.len() as u64;

        DeliveryBatch {
            flushed_at_ms: now_ms,
            notifications: notifications.into_iter().map(|(_, n)| n).collect(),
            coalesced,
            gaps,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PaneEvent, TerminalEvent, WebEvent};
    use crate::types::{EventSource, Stamp};

    fn env(pane: &str, seq: u64, event: PaneEvent) -> Arc<PaneEventEnvelope> {
        Arc::new(PaneEventEnvelope::new(
            EventSource::pane(pane),
            Stamp { epoch: 0, seq },
            seq,
            event,
        ))
    }

    fn progress(pane: &str, seq: u64, percent: u8) -> Arc<PaneEventEnvelope> {
        env(pane, seq, PaneEvent::Web(WebEvent::LoadProgress { percent }))
    }

    fn bell(pane: &str, seq: u64) -> Arc<PaneEventEnvelope> {
        env(pane, seq, PaneEvent::Terminal(TerminalEvent::Bell))
    }

    fn delivered(batch: &DeliveryBatch) -> Vec<(String, u64)> {
        batch
            .notifications
            .iter()
            .map(|n| (n.envelope.source().to_string(), n.envelope.seq()))
            .collect()
    }

    // ── 1. Lossy coalescing ──

    #[test]
    fn same_key_collapses_to_last() {
        let mut r = NotificationReducer::new(16, 0);
        for (i, pct) in [10u8, 40, 70, 100].into_iter().enumerate() {
            r.push(progress("w", i as u64 + 1, pct));
        }
        let batch = r.poll(16).expect("due");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.coalesced, 3);
        assert_eq!(
            batch.notifications[0].envelope.event(),
            &PaneEvent::Web(WebEvent::LoadProgress { percent: 100 })
        );
    }

    #[test]
    fn different_sources_do_not_collapse() {
        let mut r = NotificationReducer::new(16, 0);
        r.push(progress("a", 1, 10));
        r.push(progress("b", 1, 20));
        assert_eq!(r.flush(16).len(), 2);
    }

    // ── 2. Critical delivery ──

    #[test]
    fn critical_never_merged() {
        let mut r = NotificationReducer::new(16, 0);
        for seq in 1..=5 {
            r.push(bell("t", seq));
        }
        let batch = r.flush(16);
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.coalesced, 0);
        let seqs: Vec<u64> = batch.notifications.iter().map(|n| n.envelope.seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    // ── 3. Frame pacing ──

    #[test]
    fn flush_waits_for_frame() {
        let mut r = NotificationReducer::new(16, 100);
        r.push(bell("t", 1));
        assert!(r.poll(110).is_none());
        assert_eq!(r.next_flush_at(), 116);
        let batch = r.poll(116).expect("due");
        assert_eq!(batch.flushed_at_ms, 116);
        assert!(r.poll(200).is_none(), "nothing pending");
        assert_eq!(r.stats().flushes, 1);
    }

    // ── 4. Tier ordering ──

    #[test]
    fn focused_pane_drains_first_but_all_drain() {
        let mut r = NotificationReducer::new(16, 0);
        r.set_focus(FocusSnapshot::focused("front"));
        r.push(bell("back", 1));
        r.push(bell("front", 1));
        r.push(bell("back", 2));
        let batch = r.flush(16);
        assert_eq!(
            delivered(&batch),
            vec![
                ("pane:front".to_string(), 1),
                ("pane:back".to_string(), 1),
                ("pane:back".to_string(), 2),
            ]
        );
        assert_eq!(batch.notifications[0].tier, VisibilityTier::P0);
        assert_eq!(batch.notifications[1].tier, VisibilityTier::P2);
        assert!(!r.has_pending());
    }

    #[test]
    fn tier_resolved_at_flush_time() {
        let mut r = NotificationReducer::new(16, 0);
        r.set_focus(FocusSnapshot::focused("a"));
        r.push(bell("a", 1));
        r.push(bell("b", 1));
        r.set_focus(FocusSnapshot::focused("b"));
        let batch = r.flush(16);
        assert_eq!(batch.notifications[0].envelope.source(), &EventSource::pane("b"));
    }

    #[test]
    fn per_source_order_preserved_across_policies() {
        let mut r = NotificationReducer::new(16, 0);
        r.push(bell("t", 1));
        r.push(env(
            "t",
            2,
            PaneEvent::Terminal(TerminalEvent::OutputProgress { total_lines: 5 }),
        ));
        r.push(bell("t", 3));
        r.push(env(
            "t",
            4,
            PaneEvent::Terminal(TerminalEvent::OutputProgress { total_lines: 9 }),
        ));
        let seqs: Vec<u64> = r
            .flush(16)
            .notifications
            .iter()
            .map(|n| n.envelope.seq())
            .collect();
        assert_eq!(seqs, vec![1, 3, 4]);
    }

    // ── 5. Gaps ──

    #[test]
    fn gap_alone_makes_a_batch() {
        let mut r = NotificationReducer::new(16, 0);
        r.record_gap(DeliveryGap {
            source: EventSource::pane("t"),
            epoch: 0,
            last_seq: 4,
        });
        r.record_gap(DeliveryGap {
            source: EventSource::pane("t"),
            epoch: 0,
            last_seq: 9,
        });
        assert!(r.has_pending());
        let batch = r.poll(16).expect("due");
        assert!(batch.notifications.is_empty());
        assert!(!batch.is_empty());
        assert_eq!(batch.gaps.len(), 1);
        assert_eq!(batch.gaps[0].last_seq, 9);
        assert!(!r.has_pending());
        assert_eq!(r.stats().gaps, 1);
    }
}
