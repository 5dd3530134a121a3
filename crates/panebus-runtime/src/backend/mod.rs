//! Pane backends: the kind-specific state behind a runtime.
//!
//! A backend turns one accepted command into the domain events it caused.
//! It never sees lifecycle or metadata commands; the owning
//! [`PaneRuntime`](crate::runtime::PaneRuntime) handles those and stamps
//! every returned event into an envelope.

mod code_viewer;
mod diff;
mod terminal;
mod web;

pub use code_viewer::CodeViewerBackend;
pub use diff::DiffBackend;
pub use terminal::TerminalBackend;
pub use web::WebBackend;

use std::fmt;
use thiserror::Error;

use panebus_core::types::{PaneKind, PaneMetadata, ResourceId};
use panebus_core::{PaneCommand, PaneEvent, PaneId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The command is well-formed but not applicable right now. Local and
    /// non-fatal: the runtime stays ready.
    #[error("{0}")]
    Invalid(String),

    /// The backend can no longer operate. The runtime terminates.
    #[error("{0}")]
    Fatal(String),
}

pub trait PaneBackend: Send + fmt::Debug {
    fn kind(&self) -> PaneKind;

    /// Bring the backend up. Returned events describe its initial state.
    fn start(&mut self, metadata: &PaneMetadata) -> Result<Vec<PaneEvent>, BackendError>;

    /// Apply a kind-specific command.
    fn apply(&mut self, command: &PaneCommand) -> Result<Vec<PaneEvent>, BackendError>;

    /// `false` once the backend has stopped on its own (e.g. the terminal
    /// process exited). The runtime then terminates without a failure.
    fn is_alive(&self) -> bool {
        true
    }

    /// Release everything and report which resources were held.
    fn shutdown(&mut self) -> Vec<ResourceId>;
}

/// Default in-memory backend for a pane kind.
pub fn backend_for_kind(kind: PaneKind, pane_id: &PaneId) -> Box<dyn PaneBackend> {
    match kind {
        PaneKind::Terminal => Box::new(TerminalBackend::new(pane_id.clone())),
        PaneKind::WebView => Box::new(WebBackend::new(pane_id.clone())),
        PaneKind::Diff => Box::new(DiffBackend::new(pane_id.clone())),
        PaneKind::CodeViewer => Box::new(CodeViewerBackend::new(pane_id.clone())),
    }
}

fn wrong_domain(kind: PaneKind, command: &PaneCommand) -> BackendError {
    BackendError::Invalid(format!("{} backend cannot apply {}", kind, command.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_matches_kind() {
        let pane = PaneId::new("p1");
        for kind in PaneKind::ALL {
            assert_eq!(backend_for_kind(kind, &pane).kind(), kind);
        }
    }

    #[test]
    fn foreign_commands_are_invalid() {
        use panebus_core::command::WebCommand;
        let mut backend = backend_for_kind(PaneKind::Terminal, &PaneId::new("p1"));
        backend.start(&PaneMetadata::default()).expect("start");
        let err = backend
            .apply(&PaneCommand::Web(WebCommand::Reload))
            .expect_err("wrong domain");
        assert!(matches!(err, BackendError::Invalid(_)));
    }
}
