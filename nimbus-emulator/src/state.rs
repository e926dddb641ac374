//! Emulator server lifecycle states.

use std::fmt;

use crate::error::EmulatorError;

/// Lifecycle of a [`crate::LocalRuntime`].
///
/// Transitions only move forward; `Disposed` is terminal and reachable
/// from anywhere so teardown is always legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, nothing bound yet.
    Created,
    /// Wire listener is binding and the host is initializing.
    Starting,
    /// Serving invocations.
    Running,
    /// Stopped cleanly; can no longer serve.
    Stopped,
    /// Fully torn down.
    Disposed,
}

impl ServerState {
    /// Whether moving from `self` to `next` is allowed. Re-entering the
    /// same state is treated as a legal no-op.
    pub fn is_legal_transition(self, next: ServerState) -> bool {
        use ServerState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Created | Starting | Running, Stopped)
                | (_, Disposed)
        )
    }

    /// Advance to `next`, or fail with [`EmulatorError::InvalidState`].
    pub fn advance(&mut self, next: ServerState) -> Result<(), EmulatorError> {
        if !self.is_legal_transition(next) {
            return Err(EmulatorError::InvalidState(format!(
                "cannot move from {self} to {next}"
            )));
        }
        *self = next;
        Ok(())
    }

    /// Whether the emulator can accept (or implicitly trigger) a start.
    pub fn can_start(self) -> bool {
        matches!(self, ServerState::Created)
    }

    /// Whether invocations may be submitted.
    pub fn can_invoke(self) -> bool {
        matches!(self, ServerState::Created | ServerState::Starting | ServerState::Running)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
            ServerState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}
