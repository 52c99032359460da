//! Inbound status notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentId, ConversationId, OperationId, WorkId};
use crate::protocol::{AgentError, AgentResponse, InputRequest, ResponseBody};
use crate::task::TaskState;

/// Inbound asynchronous status update from an agent.
///
/// Any id may be absent; the receiver correlates by `work_id` first, then
/// `conversation_id`, then the explicit `operation_id`/`agent_id` pair
/// (usually taken from the callback URL).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Agent-assigned id of the deferred work.
    #[serde(
        default,
        rename = "taskId",
        alias = "task_id",
        alias = "workId",
        alias = "work_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub work_id: Option<WorkId>,
    /// Agent-assigned conversation id.
    #[serde(
        default,
        rename = "contextId",
        alias = "context_id",
        alias = "conversationId",
        alias = "conversation_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<ConversationId>,
    /// Local operation id, usually from the callback URL.
    #[serde(default, alias = "operation_id", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// Sending agent, usually from the callback URL.
    #[serde(default, alias = "agent_id", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Task name, usually from the callback URL.
    #[serde(default, alias = "task_type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Reported task state.
    pub status: TaskState,
    /// Result data on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Clarification request when input is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<InputRequest>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
    /// Sender-side timestamp, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Notification {
    /// Notification carrying only a status.
    pub fn new(status: TaskState) -> Self {
        Self {
            work_id: None,
            conversation_id: None,
            operation_id: None,
            agent_id: None,
            task_type: None,
            status,
            result: None,
            question: None,
            error: None,
            timestamp: None,
        }
    }

    /// Set the work id.
    #[must_use]
    pub fn with_work(mut self, id: impl Into<WorkId>) -> Self {
        self.work_id = Some(id.into());
        self
    }

    /// Set the conversation id.
    #[must_use]
    pub fn with_conversation(mut self, id: impl Into<ConversationId>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Set the result data.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Fill in ids the body did not carry (from the callback URL).
    #[must_use]
    pub fn with_route(
        mut self,
        task_type: Option<String>,
        operation_id: Option<OperationId>,
        agent_id: Option<AgentId>,
    ) -> Self {
        self.task_type = self.task_type.or(task_type);
        self.operation_id = self.operation_id.or(operation_id);
        self.agent_id = self.agent_id.or(agent_id);
        self
    }

    /// View the notification as an ordinary agent response.
    pub fn into_response(self) -> AgentResponse {
        let body = if let Some(error) = self.error {
            ResponseBody::Error(error)
        } else if let Some(question) = self.question {
            ResponseBody::Question(question)
        } else if let Some(result) = self.result {
            ResponseBody::Data(result)
        } else {
            ResponseBody::Empty
        };
        AgentResponse {
            status: self.status,
            conversation_id: self.conversation_id,
            work_id: self.work_id,
            body,
        }
    }
}
