//! Registered roots and deepest-prefix ownership routing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use panebus_core::WorktreeId;

use crate::canonical::comparison_key;
use crate::error::FsSourceError;

/// Scheduling class of a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityTier {
    /// Backs at least one live pane.
    ActiveInApp,
    SidebarOnly,
}

impl ActivityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveInApp => "active_in_app",
            Self::SidebarOnly => "sidebar_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredRoot {
    pub worktree_id: WorktreeId,
    /// Canonical root path (symlinks resolved).
    pub root_path: PathBuf,
    pub activity_tier: ActivityTier,
    /// Closest registered ancestor, if this root is nested.
    pub parent: Option<WorktreeId>,
    /// Registered roots directly nested under this one.
    pub nested: BTreeSet<WorktreeId>,
    key: Vec<String>,
}

/// Set of registered roots. Owned by the filesystem source only.
#[derive(Debug, Clone, Default)]
pub struct RootTable {
    roots: BTreeMap<WorktreeId, RegisteredRoot>,
    case_insensitive: bool,
}

impl RootTable {
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            roots: BTreeMap::new(),
            case_insensitive,
        }
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn get(&self, worktree_id: &WorktreeId) -> Option<&RegisteredRoot> {
        self.roots.get(worktree_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredRoot> {
        self.roots.values()
    }

    /// Add a root. `root_path` must already be canonical.
    pub fn insert(
        &mut self,
        worktree_id: WorktreeId,
        root_path: PathBuf,
        activity_tier: ActivityTier,
    ) -> Result<&RegisteredRoot, FsSourceError> {
        if self.roots.contains_key(&worktree_id) {
            return Err(FsSourceError::DuplicateWorktree(worktree_id));
        }
        let key = comparison_key(&root_path, self.case_insensitive);
        if let Some(existing) = self.roots.values().find(|r| r.key == key) {
            return Err(FsSourceError::DuplicatePath {
                path: root_path,
                existing: existing.worktree_id.clone(),
            });
        }
        self.roots.insert(
            worktree_id.clone(),
            RegisteredRoot {
                worktree_id: worktree_id.clone(),
                root_path,
                activity_tier,
                parent: None,
                nested: BTreeSet::new(),
                key,
            },
        );
        self.rebuild_nesting();
        self.roots
            .get(&worktree_id)
            .ok_or(FsSourceError::NotRegistered(worktree_id))
    }

    pub fn remove(&mut self, worktree_id: &WorktreeId) -> Result<RegisteredRoot, FsSourceError> {
        let removed = self
            .roots
            .remove(worktree_id)
            .ok_or_else(|| FsSourceError::NotRegistered(worktree_id.clone()))?;
        self.rebuild_nesting();
        Ok(removed)
    }

    pub fn set_activity_tier(
        &mut self,
        worktree_id: &WorktreeId,
        tier: ActivityTier,
    ) -> Result<(), FsSourceError> {
        let root = self
            .roots
            .get_mut(worktree_id)
            .ok_or_else(|| FsSourceError::NotRegistered(worktree_id.clone()))?;
        root.activity_tier = tier;
        Ok(())
    }

    /// Owning root for `path` and the path relative to it. The owner is the
    /// registered root with the longest component-wise prefix match.
    pub fn owner_of(&self, path: &Path) -> Option<(&RegisteredRoot, PathBuf)> {
        let key = comparison_key(path, self.case_insensitive);
        let owner = self
            .roots
            .values()
            .filter(|r| key.starts_with(&r.key))
            .max_by_key(|r| r.key.len())?;
        Some((owner, strip_components(path, owner.key.len())))
    }

    fn deepest_ancestor(&self, key: &[String]) -> Option<WorktreeId> {
        self.roots
            .values()
            .filter(|r| r.key.len() < key.len() && key.starts_with(&r.key))
            .max_by_key(|r| r.key.len())
            .map(|r| r.worktree_id.clone())
    }

    fn rebuild_nesting(&mut self) {
        let parents: Vec<(WorktreeId, Option<WorktreeId>)> = self
            .roots
            .values()
            .map(|r| (r.worktree_id.clone(), self.deepest_ancestor(&r.key)))
            .collect();
        for root in self.roots.values_mut() {
            root.parent = None;
            root.nested.clear();
        }
        for (child, parent) in parents {
            if let Some(parent) = &parent {
                if let Some(p) = self.roots.get_mut(parent) {
                    p.nested.insert(child.clone());
                }
            }
            if let Some(c) = self.roots.get_mut(&child) {
                c.parent = parent;
            }
        }
    }
}

/// Drop the first `count` key components (root dir and normal parts) from `path`.
fn strip_components(path: &Path, count: usize) -> PathBuf {
    path.components()
        .filter(|c| {
            !matches!(
                c,
                std::path::Component::CurDir | std::path::Component::ParentDir
            )
        })
        .skip(count)
        .collect()
}
