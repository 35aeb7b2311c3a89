//! Execution state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Where a request is in its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Received,
    Validating,
    Rejected,
    Validated,
    Launching,
    Running,
    Completed,
    TimedOut,
    Crashed,
    ResourceViolated,
    Cancelled,
    /// Sandbox infrastructure failed
    Failed,
    CleaningUp,
    Done,
}

impl ExecutionState {
    /// Whether `next` may follow `self`
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, Rejected | Validated)
                | (Rejected, Done)
                | (Validated, Launching | Cancelled)
                | (Launching, Running | Failed | Cancelled)
                | (
                    Running,
                    Completed | TimedOut | Crashed | ResourceViolated | Cancelled | Failed
                )
                | (
                    Completed | TimedOut | Crashed | ResourceViolated | Cancelled | Failed,
                    CleaningUp
                )
                | (Cancelled | Failed, Done)
                | (CleaningUp, Done)
        )
    }

    /// Whether this is an outcome of running the guest
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            ExecutionState::Rejected
                | ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::Crashed
                | ExecutionState::ResourceViolated
                | ExecutionState::Cancelled
                | ExecutionState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Received => "received",
            ExecutionState::Validating => "validating",
            ExecutionState::Rejected => "rejected",
            ExecutionState::Validated => "validated",
            ExecutionState::Launching => "launching",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Crashed => "crashed",
            ExecutionState::ResourceViolated => "resource_violated",
            ExecutionState::Cancelled => "cancelled",
            ExecutionState::Failed => "failed",
            ExecutionState::CleaningUp => "cleaning_up",
            ExecutionState::Done => "done",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered record of the states a request passed through
#[derive(Debug, Clone)]
pub(crate) struct StateTrace {
    states: Vec<ExecutionState>,
}

impl StateTrace {
    pub(crate) fn new() -> Self {
        Self {
            states: vec![ExecutionState::Received],
        }
    }

    pub(crate) fn current(&self) -> ExecutionState {
        self.states
            .last()
            .copied()
            .unwrap_or(ExecutionState::Received)
    }

    pub(crate) fn advance(&mut self, next: ExecutionState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Unexpected state transition");
            debug_assert!(false, "invalid transition {} -> {}", current, next);
        }
        debug!(from = %current, to = %next, "State transition");
        self.states.push(next);
    }

    pub(crate) fn into_states(self) -> Vec<ExecutionState> {
        self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn test_happy_path_is_valid() {
        let path = [
            Received, Validating, Validated, Launching, Running, Completed, CleaningUp, Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rejection_skips_launch() {
        assert!(Validating.can_transition_to(Rejected));
        assert!(Rejected.can_transition_to(Done));
        assert!(!Rejected.can_transition_to(Launching));
        assert!(!Rejected.can_transition_to(CleaningUp));
    }

    #[test]
    fn test_every_run_outcome_cleans_up() {
        for outcome in [Completed, TimedOut, Crashed, ResourceViolated, Cancelled, Failed] {
            assert!(Running.can_transition_to(outcome));
            assert!(outcome.can_transition_to(CleaningUp));
            assert!(outcome.is_outcome());
        }
        assert!(!Completed.can_transition_to(Done));
    }

    #[test]
    fn test_no_backwards_transitions() {
        assert!(!Done.can_transition_to(Received));
        assert!(!Running.can_transition_to(Launching));
        assert!(!CleaningUp.can_transition_to(Running));
        assert!(!Received.can_transition_to(Launching));
    }

    #[test]
    fn test_trace_records_order() {
        let mut trace = StateTrace::new();
        trace.advance(Validating);
        trace.advance(Rejected);
        trace.advance(Done);
        assert_eq!(trace.current(), Done);
        assert_eq!(
            trace.into_states(),
            vec![Received, Validating, Rejected, Done]
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ResourceViolated).unwrap();
        assert_eq!(json, "\"resource_violated\"");
        assert_eq!(TimedOut.to_string(), "timed_out");
    }
}
