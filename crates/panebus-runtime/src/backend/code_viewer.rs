use std::path::PathBuf;

use panebus_core::command::CodeViewerCommand;
use panebus_core::event::CodeViewerEvent;
use panebus_core::types::{PaneKind, PaneMetadata, ResourceId};
use panebus_core::{PaneCommand, PaneEvent, PaneId};

use super::{BackendError, PaneBackend, wrong_domain};

/// In-memory code viewer holding at most one open file.
#[derive(Debug)]
pub struct CodeViewerBackend {
    pane_id: PaneId,
    file: Option<PathBuf>,
    cursor: (u32, u32),
    open: bool,
}

impl CodeViewerBackend {
    pub fn new(pane_id: PaneId) -> Self {
        Self {
            pane_id,
            file: None,
            cursor: (1, 1),
            open: false,
        }
    }

    fn require_file(&self) -> Result<&PathBuf, BackendError> {
        self.file
            .as_ref()
            .ok_or_else(|| BackendError::Invalid("no file open".to_string()))
    }
}

impl PaneBackend for CodeViewerBackend {
    fn kind(&self) -> PaneKind {
        PaneKind::CodeViewer
    }

    fn start(&mut self, _metadata: &PaneMetadata) -> Result<Vec<PaneEvent>, BackendError> {
        self.open = true;
        Ok(Vec::new())
    }

    fn apply(&mut self, command: &PaneCommand) -> Result<Vec<PaneEvent>, BackendError> {
        let PaneCommand::CodeViewer(command) = command else {
            return Err(wrong_domain(self.kind(), command));
        };
        let events = match command {
            CodeViewerCommand::OpenFile { path } => {
                if path.as_os_str().is_empty() {
                    return Err(BackendError::Invalid("empty path".to_string()));
                }
                let mut events = Vec::new();
                if let Some(previous) = self.file.replace(path.clone()) {
                    events.push(CodeViewerEvent::FileClosed { path: previous });
                }
                self.cursor = (1, 1);
                events.push(CodeViewerEvent::FileOpened { path: path.clone() });
                events
            }
            CodeViewerCommand::GoToLine { line, column } => {
                self.require_file()?;
                if *line == 0 || *column == 0 {
                    return Err(BackendError::Invalid(
                        "lines and columns are 1-based".to_string(),
                    ));
                }
                self.cursor = (*line, *column);
                vec![CodeViewerEvent::CursorMoved {
                    line: *line,
                    column: *column,
                }]
            }
            CodeViewerCommand::CloseFile => {
                self.require_file()?;
                let path = self.file.take().unwrap_or_default();
                vec![CodeViewerEvent::FileClosed { path }]
            }
            CodeViewerCommand::Scroll { line } => {
                self.require_file()?;
                vec![CodeViewerEvent::ScrollPositionChanged { line: *line }]
            }
        };
        Ok(events.into_iter().map(PaneEvent::CodeViewer).collect())
    }

    fn shutdown(&mut self) -> Vec<ResourceId> {
        if !std::mem::take(&mut self.open) {
            return Vec::new();
        }
        let mut released = vec![ResourceId::new(format!("viewer:{}", self.pane_id))];
        if let Some(file) = self.file.take() {
            released.push(ResourceId::new(format!("file:{}", file.display())));
        }
        released
    }
}
