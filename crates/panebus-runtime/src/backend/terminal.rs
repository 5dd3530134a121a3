use std::path::PathBuf;

use panebus_core::command::TerminalCommand;
use panebus_core::event::TerminalEvent;
use panebus_core::types::{PaneKind, PaneMetadata, ResourceId};
use panebus_core::{PaneCommand, PaneEvent, PaneId};

use super::{BackendError, PaneBackend, wrong_domain};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
/// Exit code reported for a killed process (128 + SIGKILL).
const KILLED_EXIT_CODE: i32 = 137;

/// In-memory terminal model: grid size, line count and a live/exited flag.
#[derive(Debug)]
pub struct TerminalBackend {
    pane_id: PaneId,
    cols: u16,
    rows: u16,
    cwd: Option<PathBuf>,
    total_lines: u64,
    alive: bool,
    started: bool,
}

impl TerminalBackend {
    pub fn new(pane_id: PaneId) -> Self {
        Self {
            pane_id,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
            total_lines: 0,
            alive: false,
            started: false,
        }
    }

    fn send_input(&mut self, text: &str) -> Result<Vec<PaneEvent>, BackendError> {
        if !self.alive {
            return Err(BackendError::Fatal(format!(
                "terminal process for {} has exited",
                self.pane_id
            )));
        }
        if text.is_empty() {
            return Err(BackendError::Invalid("empty input".to_string()));
        }
        let mut events = vec![TerminalEvent::InputAccepted { bytes: text.len() }];
        for line in text.split_inclusive('\n').filter(|l| l.ends_with('\n')) {
            let command_line = line.trim().to_string();
            self.total_lines += 1;
            if command_line.is_empty() {
                continue;
            }
            if let Some(dir) = command_line.strip_prefix("cd ") {
                let target = PathBuf::from(dir.trim());
                let cwd = match &self.cwd {
                    Some(base) if target.is_relative() => base.join(target),
                    _ => target,
                };
                self.cwd = Some(cwd.clone());
                events.push(TerminalEvent::CwdChanged { cwd });
            }
            events.push(TerminalEvent::CommandStarted { command_line });
        }
        if text.ends_with('\n') {
            events.push(TerminalEvent::OutputProgress {
                total_lines: self.total_lines,
            });
        }
        Ok(events.into_iter().map(PaneEvent::Terminal).collect())
    }
}

impl PaneBackend for TerminalBackend {
    fn kind(&self) -> PaneKind {
        PaneKind::Terminal
    }

    fn start(&mut self, metadata: &PaneMetadata) -> Result<Vec<PaneEvent>, BackendError> {
        if self.started {
            return Err(BackendError::Fatal("terminal already started".to_string()));
        }
        self.started = true;
        self.alive = true;
        self.cwd = metadata.cwd.clone();
        let mut events = vec![TerminalEvent::Resized {
            cols: self.cols,
            rows: self.rows,
        }];
        if let Some(cwd) = &self.cwd {
            events.push(TerminalEvent::CwdChanged { cwd: cwd.clone() });
        }
        Ok(events.into_iter().map(PaneEvent::Terminal).collect())
    }

    fn apply(&mut self, command: &PaneCommand) -> Result<Vec<PaneEvent>, BackendError> {
        let PaneCommand::Terminal(command) = command else {
            return Err(wrong_domain(self.kind(), command));
        };
        match command {
            TerminalCommand::SendInput { text } => self.send_input(text),
            TerminalCommand::Resize { cols, rows } => {
                if *cols == 0 || *rows == 0 {
                    return Err(BackendError::Invalid(format!(
                        "invalid terminal size {cols}x{rows}"
                    )));
                }
                self.cols = *cols;
                self.rows = *rows;
                Ok(vec![PaneEvent::Terminal(TerminalEvent::Resized {
                    cols: *cols,
                    rows: *rows,
                })])
            }
            TerminalCommand::Clear => {
                self.total_lines = 0;
                Ok(vec![PaneEvent::Terminal(TerminalEvent::Cleared)])
            }
            TerminalCommand::Kill => {
                if !self.alive {
                    return Err(BackendError::Invalid("process already exited".to_string()));
                }
                self.alive = false;
                Ok(vec![PaneEvent::Terminal(TerminalEvent::ProcessExited {
                    exit_code: KILLED_EXIT_CODE,
                })])
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive || !self.started
    }

    fn shutdown(&mut self) -> Vec<ResourceId> {
        let mut released = Vec::new();
        if self.alive {
            self.alive = false;
            released.push(ResourceId::new(format!("pty:{}", self.pane_id)));
        }
        if self.started {
            released.push(ResourceId::new(format!("scrollback:{}", self.pane_id)));
            self.started = false;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> TerminalBackend {
        let mut t = TerminalBackend::new(PaneId::new("t1"));
        t.start(&PaneMetadata::default()).expect("start");
        t
    }

    fn input(text: &str) -> PaneCommand {
        PaneCommand::Terminal(TerminalCommand::SendInput {
            text: text.to_string(),
        })
    }

    #[test]
    fn input_lines_start_commands() {
        let mut t = started();
        let events = t.apply(&input("ls\ncd src\n")).expect("apply");
        assert_eq!(
            events,
            vec![
                PaneEvent::Terminal(TerminalEvent::InputAccepted { bytes: 10 }),
                PaneEvent::Terminal(TerminalEvent::CommandStarted {
                    command_line: "ls".to_string()
                }),
                PaneEvent::Terminal(TerminalEvent::CwdChanged {
                    cwd: PathBuf::from("src")
                }),
                PaneEvent::Terminal(TerminalEvent::CommandStarted {
                    command_line: "cd src".to_string()
                }),
                PaneEvent::Terminal(TerminalEvent::OutputProgress { total_lines: 2 }),
            ]
        );
    }

    #[test]
    fn zero_size_resize_is_invalid() {
        let mut t = started();
        let err = t
            .apply(&PaneCommand::Terminal(TerminalCommand::Resize { cols: 0, rows: 10 }))
            .expect_err("invalid");
        assert!(matches!(err, BackendError::Invalid(_)));
    }

    #[test]
    fn input_after_kill_is_fatal() {
        let mut t = started();
        t.apply(&PaneCommand::Terminal(TerminalCommand::Kill))
            .expect("kill");
        assert!(!t.is_alive());
        let err = t.apply(&input("echo\n")).expect_err("dead");
        assert!(matches!(err, BackendError::Fatal(_)));
    }

    #[test]
    fn shutdown_releases_once() {
        let mut t = started();
        let released = t.shutdown();
        assert_eq!(
            released,
            vec![ResourceId::new("pty:t1"), ResourceId::new("scrollback:t1")]
        );
        assert!(t.shutdown().is_empty());
    }
}
