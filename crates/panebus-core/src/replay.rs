//! Bounded per-source replay ring.
//!
//! One buffer per source. Appends are epoch-aware: an envelope from a newer
//! epoch discards everything retained from older epochs, since `seq` values
//! are not comparable across the boundary.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use crate::reducer::DeliveryGap;
use crate::types::{EventSource, PaneEventEnvelope, Stamp};

pub const DEFAULT_REPLAY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("non-monotonic seq for {source_id} in epoch {epoch}: last {last_seq}, got {got}")]
    NonMonotonic {
        source_id: EventSource,
        epoch: u64,
        last_seq: u64,
        got: u64,
    },
    #[error("envelope from {got} appended to buffer for {expected}")]
    SourceMismatch {
        expected: EventSource,
        got: EventSource,
    },
    #[error("stale epoch for {source_id}: current {current}, got {got}")]
    StaleEpoch {
        source_id: EventSource,
        current: u64,
        got: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapReason {
    /// Requested entries were evicted by capacity.
    Evicted,
    /// The caller's epoch is no longer current.
    EpochReset,
}

/// Outcome of a replay request. A gap means "resync from a snapshot".
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayResult {
    Events(Vec<Arc<PaneEventEnvelope>>),
    Gap {
        reason: GapReason,
        requested_seq: u64,
        /// Oldest seq still retained, `None` if the buffer is empty.
        oldest_retained: Option<u64>,
        epoch: u64,
    },
}

impl ReplayResult {
    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }

    /// Envelopes if this is not a gap.
    pub fn events(&self) -> Option<&[Arc<PaneEventEnvelope>]> {
        match self {
            Self::Events(events) => Some(events),
            Self::Gap { .. } => None,
        }
    }
}

/// What a consumer that lost its place in the live stream can get back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recovery {
    /// Retained envelopes after the consumer's cursor, oldest first.
    pub events: Vec<Arc<PaneEventEnvelope>>,
    /// Set when envelopes after the cursor were already evicted.
    pub lost: Option<DeliveryGap>,
}

#[derive(Debug)]
pub struct ReplayBuffer {
    source: EventSource,
    capacity: usize,
    entries: VecDeque<Arc<PaneEventEnvelope>>,
    epoch: u64,
    last_seq: u64,
    /// Highest seq dropped from the front in the current epoch.
    evicted_through: u64,
    total_evicted: u64,
}

impl ReplayBuffer {
    /// Capacity is clamped to at least 1.
    pub fn new(source: EventSource, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            capacity,
            entries: VecDeque::with_capacity(capacity),
            epoch: 0,
            last_seq: 0,
            evicted_through: 0,
            total_evicted: 0,
        }
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seq())
    }

    /// Append one envelope. Returns the evicted entry when at capacity.
    pub fn append(
        &mut self,
        envelope: Arc<PaneEventEnvelope>,
    ) -> Result<Option<Arc<PaneEventEnvelope>>, ReplayError> {
        if envelope.source() != &self.source {
            return Err(ReplayError::SourceMismatch {
                expected: self.source.clone(),
                got: envelope.source().clone(),
            });
        }
        let (epoch, seq) = (envelope.epoch(), envelope.seq());
        if epoch < self.epoch {
            return Err(ReplayError::StaleEpoch {
                source_id: self.source.clone(),
                current: self.epoch,
                got: epoch,
            });
        }
        if epoch > self.epoch {
            self.entries.clear();
            self.epoch = epoch;
            self.last_seq = 0;
            self.evicted_through = 0;
        } else if seq <= self.last_seq {
            return Err(ReplayError::NonMonotonic {
                source_id: self.source.clone(),
                epoch,
                last_seq: self.last_seq,
                got: seq,
            });
        }

        let evicted = if self.entries.len() == self.capacity {
            let old = self.entries.pop_front();
            if let Some(old) = &old {
                self.evicted_through = old.seq();
                self.total_evicted += 1;
            }
            old
        } else {
            None
        };
        self.last_seq = seq;
        self.entries.push_back(envelope);
        Ok(evicted)
    }

    /// Entries with `seq > from_seq` in the current epoch, or a gap if any of
    /// them were evicted. Does not mutate the buffer.
    pub fn replay(&self, from_seq: u64) -> ReplayResult {
        if from_seq < self.evicted_through {
            return ReplayResult::Gap {
                reason: GapReason::Evicted,
                requested_seq: from_seq,
                oldest_retained: self.oldest_seq(),
                epoch: self.epoch,
            };
        }
        ReplayResult::Events(
            self.entries
                .iter()
                .filter(|e| e.seq() > from_seq)
                .cloned()
                .collect(),
        )
    }

    /// Like [`replay`](Self::replay), but the caller states which epoch its
    /// cursor belongs to. A mismatched epoch is always a gap.
    pub fn replay_from(&self, epoch: u64, from_seq: u64) -> ReplayResult {
        if epoch != self.epoch {
            return ReplayResult::Gap {
                reason: GapReason::EpochReset,
                requested_seq: from_seq,
                oldest_retained: self.oldest_seq(),
                epoch: self.epoch,
            };
        }
        self.replay(from_seq)
    }

    /// Everything retained after `cursor` (the last stamp a consumer saw
    /// from this source, `None` if it saw nothing). A cursor from an older
    /// epoch recovers the whole current epoch. Unlike [`replay`](Self::replay),
    /// an eviction does not withhold what is still retained.
    pub fn recover(&self, cursor: Option<Stamp>) -> Recovery {
        let from_seq = match cursor {
            Some(stamp) if stamp.epoch == self.epoch => stamp.seq,
            Some(stamp) if stamp.epoch > self.epoch => return Recovery::default(),
            _ => 0,
        };
        let lost = (from_seq < self.evicted_through).then(|| DeliveryGap {
            source: self.source.clone(),
            epoch: self.epoch,
            last_seq: self.evicted_through,
        });
        Recovery {
            events: self
                .entries
                .iter()
                .filter(|e| e.seq() > from_seq)
                .cloned()
                .collect(),
            lost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PaneEvent, TerminalEvent};
    use crate::types::Stamp;
    use proptest::prelude::*;

    fn env(pane: &str, epoch: u64, seq: u64) -> Arc<PaneEventEnvelope> {
        Arc::new(PaneEventEnvelope::new(
            EventSource::pane(pane),
            Stamp { epoch, seq },
            seq,
            PaneEvent::Terminal(TerminalEvent::Bell),
        ))
    }

    fn seqs(result: &ReplayResult) -> Vec<u64> {
        result
            .events()
            .expect("not a gap")
            .iter()
            .map(|e| e.seq())
            .collect()
    }

    #[test]
    fn replay_returns_entries_after_seq() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 8);
        for seq in 1..=5 {
            buf.append(env("p1", 0, seq)).expect("append");
        }
        assert_eq!(seqs(&buf.replay(0)), vec![1, 2, 3, 4, 5]);
        assert_eq!(seqs(&buf.replay(3)), vec![4, 5]);
        assert!(seqs(&buf.replay(5)).is_empty());
        assert!(seqs(&buf.replay(99)).is_empty());
    }

    #[test]
    fn eviction_at_capacity_and_gap() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 3);
        for seq in 1..=3 {
            assert!(buf.append(env("p1", 0, seq)).expect("append").is_none());
        }
        let evicted = buf.append(env("p1", 0, 4)).expect("append");
        assert_eq!(evicted.map(|e| e.seq()), Some(1));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.oldest_seq(), Some(2));

        // seq 1 is gone, so a cursor at 0 cannot be continued.
        match buf.replay(0) {
            ReplayResult::Gap {
                reason,
                oldest_retained,
                ..
            } => {
                assert_eq!(reason, GapReason::Evicted);
                assert_eq!(oldest_retained, Some(2));
            }
            other => panic!("expected gap, got {other:?}"),
        }
        // A cursor at 1 needs 2.. which is still retained.
        assert_eq!(seqs(&buf.replay(1)), vec![2, 3, 4]);
    }

    #[test]
    fn replay_is_idempotent() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 4);
        for seq in 1..=6 {
            buf.append(env("p1", 0, seq)).expect("append");
        }
        assert_eq!(buf.replay(3), buf.replay(3));
        assert_eq!(buf.replay(0), buf.replay(0));
    }

    #[test]
    fn non_monotonic_rejected() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 4);
        buf.append(env("p1", 0, 2)).expect("append");
        let err = buf.append(env("p1", 0, 2)).expect_err("duplicate seq");
        assert!(matches!(err, ReplayError::NonMonotonic { last_seq: 2, got: 2, .. }));
        assert!(buf.append(env("p1", 0, 1)).is_err());
    }

    #[test]
    fn source_mismatch_rejected() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 4);
        let err = buf.append(env("p2", 0, 1)).expect_err("wrong source");
        assert!(matches!(err, ReplayError::SourceMismatch { .. }));
    }

    #[test]
    fn newer_epoch_discards_history() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 2);
        for seq in 1..=3 {
            buf.append(env("p1", 0, seq)).expect("append");
        }
        buf.append(env("p1", 1, 1)).expect("new epoch");
        assert_eq!(buf.epoch(), 1);
        assert_eq!(seqs(&buf.replay(0)), vec![1]);

        assert!(matches!(
            buf.replay_from(0, 3),
            ReplayResult::Gap {
                reason: GapReason::EpochReset,
                epoch: 1,
                ..
            }
        ));
        assert_eq!(seqs(&buf.replay_from(1, 0)), vec![1]);

        let err = buf.append(env("p1", 0, 9)).expect_err("stale epoch");
        assert!(matches!(err, ReplayError::StaleEpoch { current: 1, got: 0, .. }));
    }

    #[test]
    fn recover_returns_tail_and_reports_eviction() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 3);
        for seq in 1..=5 {
            buf.append(env("p1", 0, seq)).expect("append");
        }
        let caught_up = buf.recover(Some(Stamp { epoch: 0, seq: 3 }));
        assert_eq!(caught_up.lost, None);
        assert_eq!(
            caught_up.events.iter().map(|e| e.seq()).collect::<Vec<_>>(),
            vec![4, 5]
        );

        let behind = buf.recover(Some(Stamp { epoch: 0, seq: 1 }));
        assert_eq!(
            behind.lost,
            Some(DeliveryGap {
                source: EventSource::pane("p1"),
                epoch: 0,
                last_seq: 2,
            })
        );
        assert_eq!(
            behind.events.iter().map(|e| e.seq()).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[test]
    fn recover_from_older_epoch_takes_whole_epoch() {
        let mut buf = ReplayBuffer::new(EventSource::pane("p1"), 8);
        buf.append(env("p1", 1, 1)).expect("append");
        buf.append(env("p1", 1, 2)).expect("append");
        let recovered = buf.recover(Some(Stamp { epoch: 0, seq: 40 }));
        assert_eq!(recovered.events.len(), 2);
        assert!(recovered.lost.is_none());
        assert_eq!(buf.recover(None).events.len(), 2);
        assert_eq!(buf.recover(Some(Stamp { epoch: 2, seq: 0 })), Recovery::default());
    }

    proptest! {
        #[test]
        fn retained_seqs_strictly_increase(
            seqs_in in proptest::collection::vec(1u64..500, 1..100),
            capacity in 1usize..16,
        ) {
            let mut buf = ReplayBuffer::new(EventSource::pane("p"), capacity);
            let mut accepted = Vec::new();
            for seq in seqs_in {
                if buf.append(env("p", 0, seq)).is_ok() {
                    accepted.push(seq);
                }
            }
            prop_assert!(accepted.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(buf.len() <= capacity);
            if let ReplayResult::Events(events) = buf.replay(buf.evicted_through) {
                prop_assert!(events.windows(2).all(|w| w[0].seq() < w[1].seq()));
                let tail: Vec<u64> = accepted.iter().rev().take(buf.len()).rev().copied().collect();
                let got: Vec<u64> = events.iter().map(|e| e.seq()).collect();
                prop_assert_eq!(got, tail);
            } else {
                prop_assert!(false, "cursor at evicted_through is never a gap");
            }
        }
    }
}
