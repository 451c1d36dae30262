//! Health run state machine
//!
//! IDLE → RUNNING(mode) → PASSED | FAILED(kind) | ERRORED
//!
//! State transitions:
//! - IDLE → RUNNING: a run starts
//! - RUNNING → PASSED: every probe in the mode passed
//! - RUNNING → FAILED: a probe raised a classified failure
//! - RUNNING → ERRORED: a probe failed without a classification
//! - PASSED → RUNNING: the next continuous cycle starts
//!
//! FAILED and ERRORED are terminal: the process exits after them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CheckKind;
use crate::orchestrator::RunMode;

/// States of a health run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Nothing has run yet
    Idle,
    /// Probes of the given mode are executing
    Running(RunMode),
    /// The last run found nothing wrong
    Passed,
    /// A probe raised a classified failure
    Failed(CheckKind),
    /// A probe failed in a way that could not be classified
    Errored,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Failed(_) | RunState::Errored)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "IDLE"),
            RunState::Running(mode) => write!(f, "RUNNING({})", mode),
            RunState::Passed => write!(f, "PASSED"),
            RunState::Failed(kind) => write!(f, "FAILED({})", kind),
            RunState::Errored => write!(f, "ERRORED"),
        }
    }
}

/// Event driving a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Started(RunMode),
    AllPassed,
    CheckFailed(CheckKind),
    Unclassified,
}

/// State transition result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub changed: bool,
    pub at: DateTime<Utc>,
}

impl StateTransition {
    fn no_change(state: RunState) -> Self {
        Self {
            from: state,
            to: state,
            changed: false,
            at: Utc::now(),
        }
    }

    fn transition(from: RunState, to: RunState) -> Self {
        Self {
            from,
            to,
            changed: true,
            at: Utc::now(),
        }
    }
}

/// Tracks the state of the health runs in this process
#[derive(Debug, Clone)]
pub struct RunTracker {
    state: RunState,
    state_changed_at: DateTime<Utc>,
    cycles: u64,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            state_changed_at: Utc::now(),
            cycles: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn state_changed_at(&self) -> DateTime<Utc> {
        self.state_changed_at
    }

    /// Number of runs started
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Apply an event
    pub fn handle(&mut self, event: RunEvent) -> StateTransition {
        let next = match (self.state, event) {
            (RunState::Idle | RunState::Passed, RunEvent::Started(mode)) => {
                self.cycles += 1;
                RunState::Running(mode)
            }
            (RunState::Running(_), RunEvent::AllPassed) => RunState::Passed,
            (RunState::Running(_), RunEvent::CheckFailed(kind)) => RunState::Failed(kind),
            (RunState::Running(_), RunEvent::Unclassified) => RunState::Errored,
            (state, event) if state.is_terminal() => {
                warn!(state = %state, event = ?event, "Ignoring event in terminal state");
                return StateTransition::no_change(state);
            }
            (state, event) => {
                debug!(state = %state, event = ?event, "Ignoring event");
                return StateTransition::no_change(state);
            }
        };

        let transition = StateTransition::transition(self.state, next);
        info!(from = %transition.from, to = %transition.to, "Run state transition");
        self.state = next;
        self.state_changed_at = transition.at;
        transition
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_cycle() {
        let mut tracker = RunTracker::new();
        let t = tracker.handle(RunEvent::Started(RunMode::NonInvasive));
        assert!(t.changed);
        assert_eq!(t.to, RunState::Running(RunMode::NonInvasive));

        tracker.handle(RunEvent::AllPassed);
        assert_eq!(tracker.state(), RunState::Passed);

        // continuous mode starts again from PASSED
        tracker.handle(RunEvent::Started(RunMode::NonInvasive));
        assert_eq!(tracker.cycles(), 2);
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut tracker = RunTracker::new();
        tracker.handle(RunEvent::Started(RunMode::Fast));
        tracker.handle(RunEvent::CheckFailed(CheckKind::Rma));
        assert_eq!(tracker.state(), RunState::Failed(CheckKind::Rma));

        let t = tracker.handle(RunEvent::Started(RunMode::Fast));
        assert!(!t.changed);
        assert_eq!(tracker.state(), RunState::Failed(CheckKind::Rma));
    }

    #[test]
    fn test_unclassified() {
        let mut tracker = RunTracker::new();
        tracker.handle(RunEvent::Started(RunMode::Full));
        tracker.handle(RunEvent::Unclassified);
        assert_eq!(tracker.state(), RunState::Errored);
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_events_outside_a_run_are_ignored() {
        let mut tracker = RunTracker::new();
        let t = tracker.handle(RunEvent::AllPassed);
        assert!(!t.changed);
        assert_eq!(tracker.state(), RunState::Idle);
    }

    #[test]
    fn test_display() {
        assert_eq!(RunState::Running(RunMode::Fast).to_string(), "RUNNING(fast)");
        assert_eq!(RunState::Failed(CheckKind::PowerCycle).to_string(), "FAILED(power_cycle)");
    }
}
