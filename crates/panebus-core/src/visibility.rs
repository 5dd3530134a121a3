//! Visibility tiers: delivery ordering across panes from focus state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::types::{EventSource, PaneEventEnvelope, PaneId, WorktreeId};

/// Delivery priority of a pane. `P0` drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityTier {
    /// Focused pane while the app is active.
    P0,
    /// On screen.
    P1,
    /// Off screen, app active.
    P2,
    /// Off screen, app in background.
    P3,
}

impl VisibilityTier {
    pub const ALL: [Self; 4] = [Self::P0, Self::P1, Self::P2, Self::P3];

    pub fn as_u8(self) -> u8 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P3 => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "p0",
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
        }
    }
}

impl fmt::Display for VisibilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application focus state supplied by the workspace layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusSnapshot {
    pub app_active: bool,
    pub focused_pane: Option<PaneId>,
    #[serde(default)]
    pub visible_panes: BTreeSet<PaneId>,
}

impl FocusSnapshot {
    pub fn focused(pane: impl Into<PaneId>) -> Self {
        let pane = pane.into();
        Self {
            app_active: true,
            visible_panes: BTreeSet::from([pane.clone()]),
            focused_pane: Some(pane),
        }
    }

    pub fn tier_for(&self, pane: &PaneId) -> VisibilityTier {
        let focused = self.focused_pane.as_ref() == Some(pane);
        match (self.app_active, focused, self.visible_panes.contains(pane)) {
            (true, true, _) => VisibilityTier::P0,
            (false, true, _) | (_, false, true) => VisibilityTier::P1,
            (true, false, false) => VisibilityTier::P2,
            (false, false, false) => VisibilityTier::P3,
        }
    }
}

/// Resolves the tier of any envelope. System envelopes carrying a worktree
/// facet inherit the best tier among panes bound to that worktree.
#[derive(Debug, Clone, Default)]
pub struct VisibilityResolver {
    focus: FocusSnapshot,
    pane_worktrees: HashMap<PaneId, WorktreeId>,
}

impl VisibilityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn focus(&self) -> &FocusSnapshot {
        &self.focus
    }

    pub fn set_focus(&mut self, focus: FocusSnapshot) {
        self.focus = focus;
    }

    pub fn bind_pane(&mut self, pane: PaneId, worktree: WorktreeId) {
        self.pane_worktrees.insert(pane, worktree);
    }

    pub fn forget_pane(&mut self, pane: &PaneId) {
        self.pane_worktrees.remove(pane);
    }

    pub fn tier_for_pane(&self, pane: &PaneId) -> VisibilityTier {
        self.focus.tier_for(pane)
    }

    pub fn tier_for_worktree(&self, worktree: &WorktreeId) -> VisibilityTier {
        self.pane_worktrees
            .iter()
            .filter(|(_, w)| *w == worktree)
            .map(|(pane, _)| self.focus.tier_for(pane))
            .min()
            .unwrap_or(VisibilityTier::P3)
    }

    pub fn tier_for_envelope(&self, envelope: &PaneEventEnvelope) -> VisibilityTier {
        match envelope.source() {
            EventSource::Pane(pane) => self.tier_for_pane(pane),
            EventSource::System(_) => match &envelope.source_facets().worktree_id {
                Some(worktree) => self.tier_for_worktree(worktree),
                None => VisibilityTier::P3,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PaneId {
        PaneId::new(s)
    }

    #[test]
    fn tier_table() {
        let focus = FocusSnapshot {
            app_active: true,
            focused_pane: Some(pid("a")),
            visible_panes: BTreeSet::from([pid("a"), pid("b")]),
        };
        assert_eq!(focus.tier_for(&pid("a")), VisibilityTier::P0);
        assert_eq!(focus.tier_for(&pid("b")), VisibilityTier::P1);
        assert_eq!(focus.tier_for(&pid("c")), VisibilityTier::P2);

        let background = FocusSnapshot {
            app_active: false,
            ..focus
        };
        assert_eq!(background.tier_for(&pid("a")), VisibilityTier::P1);
        assert_eq!(background.tier_for(&pid("b")), VisibilityTier::P1);
        assert_eq!(background.tier_for(&pid("c")), VisibilityTier::P3);
    }

    #[test]
    fn worktree_inherits_best_bound_pane() {
        let mut resolver = VisibilityResolver::new();
        resolver.bind_pane(pid("a"), WorktreeId::new("W1"));
        resolver.bind_pane(pid("b"), WorktreeId::new("W1"));
        resolver.set_focus(FocusSnapshot::focused("b"));
        assert_eq!(
            resolver.tier_for_worktree(&WorktreeId::new("W1")),
            VisibilityTier::P0
        );
        assert_eq!(
            resolver.tier_for_worktree(&WorktreeId::new("W2")),
            VisibilityTier::P3
        );
        resolver.forget_pane(&pid("b"));
        assert_eq!(
            resolver.tier_for_worktree(&WorktreeId::new("W1")),
            VisibilityTier::P2
        );
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(VisibilityTier::P0 < VisibilityTier::P3);
        assert_eq!(VisibilityTier::ALL.map(VisibilityTier::as_u8), [0, 1, 2, 3]);
    }
}
