//! The run-state machine of a single module run.

use serde::{Deserialize, Serialize};

/// State of one module run.
///
/// `AwaitingTool` is re-entrant: each tool round trip returns to
/// `Running`. `Completed` and `Failed` are terminal; no further steps
/// execute once either is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, nothing invoked yet.
    Pending,
    /// A step is executing.
    Running,
    /// Blocked on a recursive tool invocation.
    AwaitingTool,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

impl RunState {
    /// Whether the run is finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self → to` is a legal transition.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::AwaitingTool)
                | (Self::AwaitingTool, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert!(RunState::Pending.can_transition(RunState::Running));
        assert!(RunState::Running.can_transition(RunState::AwaitingTool));
        assert!(RunState::AwaitingTool.can_transition(RunState::Running));
        assert!(RunState::Running.can_transition(RunState::Completed));
        assert!(RunState::Running.can_transition(RunState::Failed));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                RunState::Pending,
                RunState::Running,
                RunState::AwaitingTool,
                RunState::Completed,
                RunState::Failed,
            ] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn no_skipping_pending() {
        assert!(!RunState::Pending.can_transition(RunState::Completed));
        assert!(!RunState::Pending.can_transition(RunState::AwaitingTool));
        assert!(!RunState::AwaitingTool.can_transition(RunState::Completed));
    }
}
