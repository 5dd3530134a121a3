//! Runtime lifecycle state machine.
//!
//! `created → ready → draining → terminated`, forward-only. Skipping ahead is
//! allowed (a runtime can fail straight from `ready` to `terminated`), moving
//! back or re-entering a state is not. Backend failure is represented as
//! `terminated` with a recorded failure cause.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Ready = 1,
    Draining = 2,
    Terminated = 3,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }

    /// Commands are only accepted in `ready`.
    pub fn accepts_commands(self) -> bool {
        self == Self::Ready
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("illegal lifecycle transition {from} -> {to}")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// A completed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: LifecycleState,
    failure: Option<String>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Created,
            failure: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Failure cause if the runtime terminated because its backend died.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    fn advance(&mut self, to: LifecycleState) -> Result<Transition, LifecycleError> {
        if to <= self.state {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok(Transition { from, to })
    }

    pub fn mark_ready(&mut self) -> Result<Transition, LifecycleError> {
        self.advance(LifecycleState::Ready)
    }

    pub fn begin_drain(&mut self) -> Result<Transition, LifecycleError> {
        self.advance(LifecycleState::Draining)
    }

    /// Converge to `terminated` from any state. `None` if already there.
    pub fn terminate(&mut self) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.advance(LifecycleState::Terminated).ok()
    }

    /// Record a backend failure and terminate. The first failure cause wins;
    /// failing an already-terminated lifecycle changes nothing.
    pub fn fail(&mut self, reason: impl Into<String>) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.failure = Some(reason.into());
        self.terminate()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
