//! Per-agent results of a run or a fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::TaskError;
use crate::ids::{AgentId, ConversationId, OperationId, WorkId};
use crate::protocol::AgentConfig;
use crate::task::TaskState;

/// Coarse result of one agent run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Finished with data.
    Completed,
    /// Suspended on deferred work; resumes on notification.
    Pending,
    /// Finished with an error.
    Failed,
}

/// Who ran what, when, and how far it got.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeMetadata {
    /// Agent the outcome belongs to.
    pub agent_id: AgentId,
    /// Display name, empty when unset.
    pub agent_name: String,
    /// Operation the run belonged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// Task name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall time from start to this outcome.
    pub response_time_ms: u64,
    /// Last known task state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<TaskState>,
    /// Questions answered during the run.
    #[serde(default)]
    pub clarification_rounds: u32,
    /// Conversation id, if the agent disclosed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Deferred-work id, if the agent disclosed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
}

impl OutcomeMetadata {
    /// Metadata for a run starting now.
    pub fn new(agent: &AgentConfig) -> Self {
        Self {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            operation_id: None,
            task: None,
            started_at: Utc::now(),
            response_time_ms: 0,
            final_state: None,
            clarification_rounds: 0,
            conversation_id: None,
            work_id: None,
        }
    }

    /// Stamp `response_time_ms` from `started_at`.
    #[must_use]
    pub fn finish(mut self) -> Self {
        let elapsed = Utc::now() - self.started_at;
        self.response_time_ms = u64::try_from(elapsed.num_milliseconds()).unwrap_or(0);
        self
    }
}

/// One agent's outcome. Carries either `data` or `error`, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome<T = Value> {
    /// False only for failed outcomes.
    pub success: bool,
    /// Coarse result.
    pub status: OutcomeStatus,
    /// Result data; absent on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Run details.
    pub metadata: OutcomeMetadata,
}

impl<T> AgentOutcome<T> {
    /// Successful outcome.
    pub fn completed(data: T, metadata: OutcomeMetadata) -> Self {
        Self {
            success: true,
            status: OutcomeStatus::Completed,
            data: Some(data),
            error: None,
            metadata,
        }
    }

    /// Failed outcome.
    pub fn failed(error: TaskError, metadata: OutcomeMetadata) -> Self {
        Self {
            success: false,
            status: OutcomeStatus::Failed,
            data: None,
            error: Some(error),
            metadata,
        }
    }

    /// Whether the task is suspended on deferred work.
    pub fn is_pending(&self) -> bool {
        self.status == OutcomeStatus::Pending
    }

    /// Agent the outcome belongs to.
    pub fn agent_id(&self) -> &AgentId {
        &self.metadata.agent_id
    }

    /// Transform the data, keeping everything else.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AgentOutcome<U> {
        AgentOutcome {
            success: self.success,
            status: self.status,
            data: self.data.map(f),
            error: self.error,
            metadata: self.metadata,
        }
    }
}

impl AgentOutcome<Value> {
    /// Suspended outcome. `data` summarises the ids a later notification
    /// will be correlated by.
    pub fn pending(metadata: OutcomeMetadata) -> Self {
        let data = json!({
            "status": "pending",
            "workId": metadata.work_id,
            "conversationId": metadata.conversation_id,
            "operationId": metadata.operation_id,
        });
        Self {
            success: true,
            status: OutcomeStatus::Pending,
            data: Some(data),
            error: None,
            metadata,
        }
    }
}

/// Uninterpreted per-agent settle result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Settled<T> {
    /// The agent's future returned a value.
    #[serde(rename_all = "camelCase")]
    Fulfilled {
        /// Agent the value came from.
        agent_id: AgentId,
        /// Returned value.
        value: T,
    },
    /// The agent's future failed or panicked.
    #[serde(rename_all = "camelCase")]
    Rejected {
        /// Agent that failed.
        agent_id: AgentId,
        /// Classified failure.
        reason: TaskError,
    },
}

impl<T> Settled<T> {
    /// Agent the result belongs to.
    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::Fulfilled { agent_id, .. } | Self::Rejected { agent_id, .. } => agent_id,
        }
    }

    /// Whether the agent returned a value.
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }

    /// Convert into a plain `Result`.
    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            Self::Fulfilled { value, .. } => Ok(value),
            Self::Rejected { reason, .. } => Err(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{codes, Recovery};

    fn meta() -> OutcomeMetadata {
        OutcomeMetadata::new(&AgentConfig::new("a1", "https://a1.test"))
    }

    #[test]
    fn completed_has_data_only() {
        let o = AgentOutcome::completed(json!({"status": "ok"}), meta());
        assert!(o.success);
        assert!(o.data.is_some() && o.error.is_none());
    }

    #[test]
    fn failed_has_error_only() {
        let o: AgentOutcome = AgentOutcome::failed(
            TaskError::new(codes::TIMEOUT, "slow", Recovery::Transient),
            meta(),
        );
        assert!(!o.success);
        assert!(o.data.is_none() && o.error.is_some());
        let json = serde_json::to_value(&o).unwrap();
        assert!(json.get("data").is_none());
        assert_eq!(json["status"], "failed");
    }

    #[test]
    fn pending_summarises_ids() {
        let mut m = meta();
        m.work_id = Some(WorkId::from_raw("w1"));
        let o = AgentOutcome::pending(m);
        assert!(o.success);
        assert!(o.is_pending());
        assert_eq!(o.data.unwrap()["workId"], "w1");
    }

    #[test]
    fn settled_serializes_tagged() {
        let s: Settled<u32> = Settled::Fulfilled {
            agent_id: AgentId::from_raw("a1"),
            value: 7,
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["status"], "fulfilled");
        assert_eq!(json["agentId"], "a1");
        assert_eq!(s.into_result().unwrap(), 7);
    }
}
