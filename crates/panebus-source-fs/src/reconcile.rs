//! Delta computation between successive status reports.
//!
//! Reconciliation never re-emits unchanged state: two identical reports
//! produce an empty delta.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use panebus_core::GitStatusCounts;

use crate::status::StatusReport;

/// Why a status probe was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileReason {
    /// Follow-up to a pushed batch.
    Flush,
    /// Host resumed from sleep or the watcher reconnected.
    Wake,
    /// The native notification channel dropped events.
    Overflow,
    /// Periodic low-frequency drift check.
    DriftSweep,
    /// A consumer lost filesystem history. The next report is published in
    /// full, as if nothing had been reported before.
    Resync,
}

impl ReconcileReason {
    /// Pull reasons recover paths the watcher may have missed.
    pub fn is_pull(self) -> bool {
        !matches!(self, Self::Flush)
    }

    /// Which of two reasons a queued follow-up probe keeps.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Flush => 0,
            Self::Wake | Self::Overflow | Self::DriftSweep => 1,
            Self::Resync => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flush => "flush",
            Self::Wake => "wake",
            Self::Overflow => "overflow",
            Self::DriftSweep => "drift_sweep",
            Self::Resync => "resync",
        }
    }
}

impl fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDelta {
    /// Paths whose dirty state flipped.
    pub changed_paths: BTreeSet<PathBuf>,
    pub counts: Option<GitStatusCounts>,
    /// `Some(new)` if the branch head changed.
    pub branch: Option<Option<String>>,
}

impl StatusDelta {
    pub fn is_empty(&self) -> bool {
        self.changed_paths.is_empty() && self.counts.is_none() && self.branch.is_none()
    }
}

/// Delta from `previous` to `next`. With no previous report, counts are
/// always reported and the branch is reported if known.
pub fn diff_reports(previous: Option<&StatusReport>, next: &StatusReport) -> StatusDelta {
    match previous {
        None => StatusDelta {
            changed_paths: next.dirty_paths.clone(),
            counts: Some(next.counts),
            branch: next.branch.as_ref().map(|b| Some(b.clone())),
        },
        Some(prev) => StatusDelta {
            changed_paths: prev
                .dirty_paths
                .symmetric_difference(&next.dirty_paths)
                .cloned()
                .collect(),
            counts: (prev.counts != next.counts).then_some(next.counts),
            branch: (prev.branch != next.branch).then(|| next.branch.clone()),
        },
    }
}
