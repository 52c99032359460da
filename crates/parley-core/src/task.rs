//! Task state and the per-agent lifecycle state machine.
//!
//! ```text
//! submitted → working → {input-required ⇄ working} → {completed | failed | rejected | canceled}
//! ```
//!
//! Terminal states are immutable. [`TaskLifecycle`] is owned by one executor
//! run against one agent and records every transition it applies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestrationError;

/// Remote task status as reported by an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Request accepted, nothing reported yet.
    Submitted,
    /// Agent is working on the request.
    Working,
    /// Agent asked a clarifying question.
    #[serde(alias = "input_required")]
    InputRequired,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Agent refused the request.
    Rejected,
    /// Stopped before completion.
    #[serde(alias = "cancelled")]
    Canceled,
}

impl TaskState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::Canceled
        )
    }

    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::{Canceled, Completed, Failed, InputRequired, Rejected, Submitted, Working};
        match self {
            Submitted => matches!(next, Working | Rejected | Failed | Canceled),
            Working => matches!(next, InputRequired | Completed | Failed | Rejected | Canceled),
            InputRequired => matches!(next, Working | Failed | Canceled),
            Completed | Failed | Rejected | Canceled => false,
        }
    }

    /// Wire name (`input-required`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "submitted" | "pending" => Ok(Self::Submitted),
            "working" | "in_progress" | "in-progress" => Ok(Self::Working),
            "input-required" | "input_required" => Ok(Self::InputRequired),
            "completed" | "complete" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(OrchestrationError::ProtocolViolation(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// One applied state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State before the change.
    pub from: TaskState,
    /// State after the change.
    pub to: TaskState,
    /// When the change was applied.
    pub at: DateTime<Utc>,
}

/// State machine for one operation against one agent.
#[derive(Clone, Debug)]
pub struct TaskLifecycle {
    state: TaskState,
    history: Vec<Transition>,
}

impl TaskLifecycle {
    /// A lifecycle that has just sent its first turn.
    pub fn new() -> Self {
        Self::resume_at(TaskState::Submitted)
    }

    /// Rebuild a lifecycle from a persisted state.
    pub fn resume_at(state: TaskState) -> Self {
        Self {
            state,
            history: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Every transition applied so far, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Apply a state reported by the agent.
    ///
    /// Returns the transitions actually applied: empty when the report does
    /// not move the task (a repeated state, or a late `submitted` ack), two
    /// entries when the `submitted → working` ack is implied.
    pub fn observe(&mut self, remote: TaskState) -> Result<Vec<Transition>, OrchestrationError> {
        if self.state.is_terminal() {
            return Err(OrchestrationError::AlreadyTerminal(self.state));
        }
        if remote == self.state || remote == TaskState::Submitted {
            return Ok(Vec::new());
        }

        let mut applied = Vec::new();
        if self.state == TaskState::Submitted
            && !TaskState::Submitted.can_transition_to(remote)
            && TaskState::Working.can_transition_to(remote)
        {
            applied.push(self.apply(TaskState::Working));
        }

        if !self.state.can_transition_to(remote) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.state,
                to: remote,
            });
        }
        applied.push(self.apply(remote));
        Ok(applied)
    }

    /// `input-required → working` after an answer was sent.
    pub fn answer_sent(&mut self) -> Result<Transition, OrchestrationError> {
        self.force(TaskState::Working)
    }

    /// Force the terminal `failed` edge (local failure, not agent-reported).
    pub fn fail(&mut self) -> Result<Transition, OrchestrationError> {
        self.force(TaskState::Failed)
    }

    /// Force the terminal `canceled` edge.
    pub fn cancel(&mut self) -> Result<Transition, OrchestrationError> {
        self.force(TaskState::Canceled)
    }

    fn force(&mut self, to: TaskState) -> Result<Transition, OrchestrationError> {
        if self.state.is_terminal() {
            return Err(OrchestrationError::AlreadyTerminal(self.state));
        }
        if !self.state.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        Ok(self.apply(to))
    }

    fn apply(&mut self, to: TaskState) -> Transition {
        let transition = Transition {
            from: self.state,
            to,
            at: Utc::now(),
        };
        self.state = to;
        self.history.push(transition.clone());
        transition
    }
}

impl Default for TaskLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Rejected.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Submitted.is_terminal());
        assert!(!TaskState::Working.is_terminal());
        assert!(!TaskState::InputRequired.is_terminal());
    }

    #[test]
    fn wire_names() {
        let json = serde_json::to_string(&TaskState::InputRequired).unwrap();
        assert_eq!(json, "\"input-required\"");
        let parsed: TaskState = serde_json::from_str("\"input_required\"").unwrap();
        assert_eq!(parsed, TaskState::InputRequired);
        let parsed: TaskState = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TaskState::Canceled);
        assert_eq!("Completed".parse::<TaskState>().unwrap(), TaskState::Completed);
        assert!("exploded".parse::<TaskState>().is_err());
    }

    #[test]
    fn synchronous_completion_implies_working() {
        let mut lc = TaskLifecycle::new();
        let applied = lc.observe(TaskState::Completed).unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].to, TaskState::Working);
        assert_eq!(applied[1].to, TaskState::Completed);
        assert_eq!(lc.state(), TaskState::Completed);
        assert_eq!(lc.history().len(), 2);
    }

    #[test]
    fn clarification_round_trip() {
        let mut lc = TaskLifecycle::new();
        let _ = lc.observe(TaskState::InputRequired).unwrap();
        assert_eq!(lc.state(), TaskState::InputRequired);
        let t = lc.answer_sent().unwrap();
        assert_eq!((t.from, t.to), (TaskState::InputRequired, TaskState::Working));
        let _ = lc.observe(TaskState::InputRequired).unwrap();
        let _ = lc.answer_sent().unwrap();
        let _ = lc.observe(TaskState::Completed).unwrap();
        assert_eq!(lc.state(), TaskState::Completed);
    }

    #[test]
    fn repeated_state_is_noop() {
        let mut lc = TaskLifecycle::new();
        let _ = lc.observe(TaskState::Working).unwrap();
        assert!(lc.observe(TaskState::Working).unwrap().is_empty());
        assert!(lc.observe(TaskState::Submitted).unwrap().is_empty());
        assert_eq!(lc.state(), TaskState::Working);
    }

    #[test]
    fn terminal_is_immutable() {
        let mut lc = TaskLifecycle::new();
        let _ = lc.observe(TaskState::Completed).unwrap();
        assert!(matches!(
            lc.observe(TaskState::Working),
            Err(OrchestrationError::AlreadyTerminal(TaskState::Completed))
        ));
        assert!(lc.fail().is_err());
        assert!(lc.cancel().is_err());
    }

    #[test]
    fn completion_while_waiting_for_answer_is_invalid() {
        let mut lc = TaskLifecycle::new();
        let _ = lc.observe(TaskState::InputRequired).unwrap();
        assert!(matches!(
            lc.observe(TaskState::Completed),
            Err(OrchestrationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn fail_and_cancel_from_input_required() {
        let mut lc = TaskLifecycle::new();
        let _ = lc.observe(TaskState::InputRequired).unwrap();
        let mut other = lc.clone();
        assert_eq!(lc.fail().unwrap().to, TaskState::Failed);
        assert_eq!(other.cancel().unwrap().to, TaskState::Canceled);
    }

    #[test]
    fn resume_from_persisted_state() {
        let mut lc = TaskLifecycle::resume_at(TaskState::Working);
        let _ = lc.observe(TaskState::Completed).unwrap();
        assert_eq!(lc.history().len(), 1);
    }
}
