use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use panebus_core::command::DiffCommand;
use panebus_core::event::DiffEvent;
use panebus_core::types::{PaneKind, PaneMetadata, ResourceId};
use panebus_core::{PaneCommand, PaneEvent, PaneId};

use super::{BackendError, PaneBackend, wrong_domain};

/// In-memory diff review session: selection, staged hunks, comment count.
#[derive(Debug)]
pub struct DiffBackend {
    pane_id: PaneId,
    selected: Option<PathBuf>,
    staged: BTreeSet<(PathBuf, u32)>,
    comments: usize,
    open: bool,
}

impl DiffBackend {
    pub fn new(pane_id: PaneId) -> Self {
        Self {
            pane_id,
            selected: None,
            staged: BTreeSet::new(),
            comments: 0,
            open: false,
        }
    }

    pub fn selected(&self) -> Option<&Path> {
        self.selected.as_deref()
    }

    pub fn staged_hunks(&self) -> usize {
        self.staged.len()
    }

    pub fn comment_count(&self) -> usize {
        self.comments
    }
}

fn require_relative(path: &Path) -> Result<(), BackendError> {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return Err(BackendError::Invalid(format!(
            "diff paths must be worktree-relative: {}",
            path.display()
        )));
    }
    Ok(())
}

impl PaneBackend for DiffBackend {
    fn kind(&self) -> PaneKind {
        PaneKind::Diff
    }

    fn start(&mut self, _metadata: &PaneMetadata) -> Result<Vec<PaneEvent>, BackendError> {
        self.open = true;
        Ok(Vec::new())
    }

    fn apply(&mut self, command: &PaneCommand) -> Result<Vec<PaneEvent>, BackendError> {
        let PaneCommand::Diff(command) = command else {
            return Err(wrong_domain(self.kind(), command));
        };
        let event = match command {
            DiffCommand::SelectFile { path } => {
                require_relative(path)?;
                self.selected = Some(path.clone());
                DiffEvent::FileSelected { path: path.clone() }
            }
            DiffCommand::StageHunk { path, hunk } => {
                require_relative(path)?;
                if !self.staged.insert((path.clone(), *hunk)) {
                    return Err(BackendError::Invalid(format!(
                        "hunk {hunk} of {} already staged",
                        path.display()
                    )));
                }
                DiffEvent::HunkStaged {
                    path: path.clone(),
                    hunk: *hunk,
                }
            }
            DiffCommand::UnstageHunk { path, hunk } => {
                if !self.staged.remove(&(path.clone(), *hunk)) {
                    return Err(BackendError::Invalid(format!(
                        "hunk {hunk} of {} is not staged",
                        path.display()
                    )));
                }
                DiffEvent::HunkUnstaged {
                    path: path.clone(),
                    hunk: *hunk,
                }
            }
            DiffCommand::AddComment { path, line, body } => {
                require_relative(path)?;
                if body.trim().is_empty() {
                    return Err(BackendError::Invalid("empty comment".to_string()));
                }
                self.comments += 1;
                DiffEvent::CommentAdded {
                    path: path.clone(),
                    line: *line,
                    body: body.clone(),
                }
            }
            DiffCommand::Scroll { line } => DiffEvent::ScrollPositionChanged { line: *line },
        };
        Ok(vec![PaneEvent::Diff(event)])
    }

    fn shutdown(&mut self) -> Vec<ResourceId> {
        if !std::mem::take(&mut self.open) {
            return Vec::new();
        }
        vec![ResourceId::new(format!("diff-session:{}", self.pane_id))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> DiffBackend {
        let mut d = DiffBackend::new(PaneId::new("d1"));
        d.start(&PaneMetadata::default()).expect("start");
        d
    }

    fn stage(path: &str, hunk: u32) -> PaneCommand {
        PaneCommand::Diff(DiffCommand::StageHunk {
            path: PathBuf::from(path),
            hunk,
        })
    }

    #[test]
    fn stage_twice_is_invalid() {
        let mut d = started();
        d.apply(&stage("src/a.rs", 1)).expect("stage");
        assert!(matches!(
            d.apply(&stage("src/a.rs", 1)),
            Err(BackendError::Invalid(_))
        ));
        assert_eq!(d.staged_hunks(), 1);
    }

    #[test]
    fn unstage_requires_staged_hunk() {
        let mut d = started();
        let unstage = PaneCommand::Diff(DiffCommand::UnstageHunk {
            path: PathBuf::from("src/a.rs"),
            hunk: 2,
        });
        assert!(d.apply(&unstage).is_err());
        d.apply(&stage("src/a.rs", 2)).expect("stage");
        d.apply(&unstage).expect("unstage");
        assert_eq!(d.staged_hunks(), 0);
    }

    #[test]
    fn comments_need_body_and_relative_path() {
        let mut d = started();
        let comment = |path: &str, body: &str| {
            PaneCommand::Diff(DiffCommand::AddComment {
                path: PathBuf::from(path),
                line: 3,
                body: body.to_string(),
            })
        };
        assert!(d.apply(&comment("src/a.rs", "  ")).is_err());
        assert!(d.apply(&comment("/abs/a.rs", "nit")).is_err());
        d.apply(&comment("src/a.rs", "nit")).expect("comment");
        assert_eq!(d.comment_count(), 1);
    }
}
