//! Per-pump completion state tracked by the session coordinator.

use std::fmt;

use super::SessionError;

/// The independently scheduled units of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpKind {
    Receive,
    Stdout,
    Stderr,
    ProcessExit,
}

impl PumpKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::ProcessExit => "process-exit",
        }
    }
}

impl fmt::Display for PumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpState {
    #[default]
    Running,
    Done,
    Failed,
}

impl PumpState {
    pub const fn is_done(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Completion state of every pump plus the single fatal error.
#[derive(Debug, Default)]
pub struct PumpStates {
    receive: PumpState,
    stdout: PumpState,
    stderr: PumpState,
    process: PumpState,
    fatal: Option<SessionError>,
}

impl PumpStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn get(&self, kind: PumpKind) -> PumpState {
        match kind {
            PumpKind::Receive => self.receive,
            PumpKind::Stdout => self.stdout,
            PumpKind::Stderr => self.stderr,
            PumpKind::ProcessExit => self.process,
        }
    }

    /// Mark `kind` finished. Returns `false`, leaving the state untouched, if
    /// it had already finished.
    pub fn complete(&mut self, kind: PumpKind, failed: bool) -> bool {
        let slot = match kind {
            PumpKind::Receive => &mut self.receive,
            PumpKind::Stdout => &mut self.stdout,
            PumpKind::Stderr => &mut self.stderr,
            PumpKind::ProcessExit => &mut self.process,
        };
        if slot.is_done() {
            return false;
        }
        *slot = if failed {
            PumpState::Failed
        } else {
            PumpState::Done
        };
        true
    }

    /// Record the session's fatal error unless one is already held.
    ///
    /// A rejected error is handed back to the caller.
    pub fn record_fatal(&mut self, error: SessionError) -> Result<(), SessionError> {
        if self.fatal.is_some() {
            return Err(error);
        }
        self.fatal = Some(error);
        Ok(())
    }

    pub const fn fatal(&self) -> Option<&SessionError> {
        self.fatal.as_ref()
    }

    pub fn take_fatal(&mut self) -> Option<SessionError> {
        self.fatal.take()
    }

    /// Both output pumps and the process have finished. Input may still be
    /// open.
    pub const fn is_terminal(&self) -> bool {
        self.stdout.is_done() && self.stderr.is_done() && self.process.is_done()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_idempotent() {
        let mut states = PumpStates::new();
        assert!(states.complete(PumpKind::Stdout, true));
        assert!(!states.complete(PumpKind::Stdout, false));
        assert_eq!(states.get(PumpKind::Stdout), PumpState::Failed);
    }

    #[test]
    fn first_fatal_error_wins() {
        let mut states = PumpStates::new();
        states.record_fatal(SessionError::process("first")).unwrap();
        let rejected = states.record_fatal(SessionError::Cancelled).unwrap_err();
        assert!(rejected.is_cancelled());
        assert!(matches!(
            states.take_fatal(),
            Some(SessionError::Process { reason }) if reason == "first"
        ));
    }

    #[test]
    fn receive_is_not_part_of_terminal_condition() {
        let mut states = PumpStates::new();
        states.complete(PumpKind::Receive, false);
        assert!(!states.is_terminal());

        let mut states = PumpStates::new();
        states.complete(PumpKind::Stdout, false);
        states.complete(PumpKind::Stderr, false);
        assert!(!states.is_terminal());
        states.complete(PumpKind::ProcessExit, true);
        assert!(states.is_terminal());
        assert_eq!(states.get(PumpKind::Receive), PumpState::Running);
    }
}
