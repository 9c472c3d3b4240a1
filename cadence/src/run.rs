use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::error::TransitionError;
use crate::job::{ErrorKind, RunId};

/// Lifecycle states of a workflow run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Exhausted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Exhausted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Exhausted => "exhausted",
        }
    }

    fn can_move_to(&self, to: RunState) -> bool {
        matches!(
            (self, to),
            (RunState::Pending, RunState::Running)
                | (RunState::Running, RunState::Running)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Exhausted)
        )
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change of a run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub run_id: RunId,
    pub from: RunState,
    pub to: RunState,
    pub attempt_count: u32,
    pub error_kind: Option<ErrorKind>,
    pub at: DateTime<Utc>,
}

/// A single scheduled execution of the job, tracked to a terminal state.
///
/// Created `Pending` by the trigger; only the workflow engine moves it
/// forward. Once terminal, every further transition is rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowRun {
    id: RunId,
    attempt_count: u32,
    state: RunState,
    last_error: Option<ErrorKind>,
    scheduled_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    history: Vec<Transition>,
}

impl Default for WorkflowRun {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRun {
    pub fn new() -> Self {
        Self::with_id(RunId::new())
    }

    pub fn with_id(id: RunId) -> Self {
        Self {
            id,
            attempt_count: 0,
            state: RunState::Pending,
            last_error: None,
            scheduled_at: Utc::now(),
            finished_at: None,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Count a new launch against the attempt budget.
    pub(crate) fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        if self.state.is_terminal() {
            return Err(self.illegal(self.state));
        }
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }

    /// Apply a state change, recording the error kind that caused it.
    pub(crate) fn transition(
        &mut self,
        to: RunState,
        error_kind: Option<ErrorKind>,
    ) -> Result<Transition, TransitionError> {
        if !self.state.can_move_to(to) {
            return Err(self.illegal(to));
        }

        let transition = Transition {
            run_id: self.id,
            from: self.state,
            to,
            attempt_count: self.attempt_count,
            error_kind,
            at: Utc::now(),
        };

        if error_kind.is_some() {
            self.last_error = error_kind;
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(transition.at);
        }
        self.history.push(transition.clone());
        Ok(transition)
    }

    fn illegal(&self, to: RunState) -> TransitionError {
        TransitionError {
            run_id: self.id,
            from: self.state,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending() {
        let run = WorkflowRun::new();
        assert_eq!(run.state(), RunState::Pending);
        assert_eq!(run.attempt_count(), 0);
        assert!(run.last_error().is_none());
        assert!(run.history().is_empty());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut run = WorkflowRun::new();
        run.begin_attempt().unwrap();
        let t = run.transition(RunState::Running, None).unwrap();
        assert_eq!(t.from, RunState::Pending);
        assert_eq!(t.attempt_count, 1);

        run.transition(RunState::Succeeded, None).unwrap();
        assert!(run.is_terminal());
        assert!(run.finished_at().is_some());
        assert_eq!(run.history().len(), 2);
    }

    #[test]
    fn test_pending_cannot_finish_directly() {
        let mut run = WorkflowRun::new();
        let err = run.transition(RunState::Succeeded, None).unwrap_err();
        assert_eq!(err.from, RunState::Pending);
        assert_eq!(err.to, RunState::Succeeded);
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let mut run = WorkflowRun::new();
        run.begin_attempt().unwrap();
        run.transition(RunState::Running, None).unwrap();
        run.transition(RunState::Failed, Some(ErrorKind::NonZeroExit))
            .unwrap();

        assert!(run.transition(RunState::Running, None).is_err());
        assert!(run.transition(RunState::Succeeded, None).is_err());
        assert!(run.begin_attempt().is_err());
        assert_eq!(run.state(), RunState::Failed);
        assert_eq!(run.attempt_count(), 1);
        assert_eq!(run.last_error(), Some(ErrorKind::NonZeroExit));
    }

    #[test]
    fn test_retry_keeps_running_and_records_error() {
        let mut run = WorkflowRun::new();
        run.begin_attempt().unwrap();
        run.transition(RunState::Running, None).unwrap();
        let t = run
            .transition(RunState::Running, Some(ErrorKind::Timeout))
            .unwrap();
        assert_eq!(t.from, RunState::Running);
        assert_eq!(t.to, RunState::Running);
        assert_eq!(run.last_error(), Some(ErrorKind::Timeout));
    }
}
