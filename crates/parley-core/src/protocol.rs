//! Agent configuration and the per-turn request/response shapes exchanged
//! with a transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Recovery, TaskError};
use crate::ids::{AgentId, ConversationId, OperationId, WorkId};
use crate::task::TaskState;

/// Wire protocol spoken by an agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProtocol {
    /// Agent-to-agent task protocol.
    #[default]
    A2a,
    /// Model Context Protocol tool calls.
    Mcp,
}

/// One remote agent as configured by the caller.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Caller-assigned id, unique within a fan-out.
    pub id: AgentId,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    /// Endpoint the transport sends turns to.
    pub agent_uri: String,
    /// Wire protocol the agent speaks.
    #[serde(default)]
    pub protocol: AgentProtocol,
    /// Bearer token, never logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl AgentConfig {
    /// Agent with the default protocol and no credentials.
    pub fn new(id: impl Into<AgentId>, agent_uri: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            agent_uri: agent_uri.into(),
            protocol: AgentProtocol::default(),
            auth_token: None,
            headers: BTreeMap::new(),
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Add a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.into(), value.into());
        self
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("agent_uri", &self.agent_uri)
            .field("protocol", &self.protocol)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One turn sent to an agent.
///
/// The first turn carries neither continuation id; later turns of the same
/// conversation carry the ids the agent disclosed plus the clarification
/// answer in `input`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Operation this turn belongs to.
    pub operation_id: OperationId,
    /// Task or tool name.
    pub operation: String,
    /// Task arguments.
    pub args: Value,
    /// Conversation to continue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Deferred work to continue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
    /// Answer to the agent's last question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Where the agent should push status updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl TurnRequest {
    /// First turn of a new conversation.
    pub fn initial(operation_id: OperationId, operation: impl Into<String>, args: Value) -> Self {
        Self {
            operation_id,
            operation: operation.into(),
            args,
            conversation_id: None,
            work_id: None,
            input: None,
            callback_url: None,
        }
    }

    /// Next turn of the same conversation, answering a question.
    #[must_use]
    pub fn answer(
        &self,
        conversation_id: Option<ConversationId>,
        work_id: Option<WorkId>,
        input: Value,
    ) -> Self {
        Self {
            conversation_id: conversation_id.or_else(|| self.conversation_id.clone()),
            work_id: work_id.or_else(|| self.work_id.clone()),
            input: Some(input),
            ..self.clone()
        }
    }

    /// Set the push-notification URL.
    #[must_use]
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

/// Question asked by an agent in `input-required`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    /// Question text.
    pub question: String,
    /// Name of the argument the agent wants filled in, if it said.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Description or schema of the expected answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// Answers the agent proposed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Value>,
    /// Free-form context the agent attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl InputRequest {
    /// Question with no field hint.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    /// Name the argument being asked for.
    #[must_use]
    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Error payload reported by an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentError {
    /// Agent-defined error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Recovery class, when the agent gave one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<Recovery>,
    /// Extra structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AgentError {
    /// Error without a recovery hint.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery: None,
            details: None,
        }
    }

    /// Classify into a [`TaskError`].
    pub fn to_task_error(&self) -> TaskError {
        let err = TaskError::from_agent(&self.code, self.message.clone(), self.recovery);
        match &self.details {
            Some(details) => err.with_details(details.clone()),
            None => err,
        }
    }
}

/// What a response carried besides its status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Result data.
    Data(Value),
    /// Clarification request.
    Question(InputRequest),
    /// Failure details.
    Error(AgentError),
    /// Status only.
    Empty,
}

/// One agent response, already decoded from the wire by the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    /// Reported task state.
    pub status: TaskState,
    /// Conversation id, once assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Deferred-work id, once assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
    /// Payload besides the status.
    pub body: ResponseBody,
}

impl AgentResponse {
    /// Response with no ids.
    pub fn new(status: TaskState, body: ResponseBody) -> Self {
        Self {
            status,
            conversation_id: None,
            work_id: None,
            body,
        }
    }

    /// Completed with data.
    pub fn completed(data: Value) -> Self {
        Self::new(TaskState::Completed, ResponseBody::Data(data))
    }

    /// Working, no payload.
    pub fn working() -> Self {
        Self::new(TaskState::Working, ResponseBody::Empty)
    }

    /// Asking a question.
    pub fn input_required(question: InputRequest) -> Self {
        Self::new(TaskState::InputRequired, ResponseBody::Question(question))
    }

    /// Failed with an error.
    pub fn failed(error: AgentError) -> Self {
        Self::new(TaskState::Failed, ResponseBody::Error(error))
    }

    /// Set the conversation id.
    #[must_use]
    pub fn with_conversation(mut self, id: impl Into<ConversationId>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Set the work id.
    #[must_use]
    pub fn with_work(mut self, id: impl Into<WorkId>) -> Self {
        self.work_id = Some(id.into());
        self
    }

    /// Result data, if any.
    pub fn data(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Data(v) => Some(v),
            _ => None,
        }
    }

    /// Question, if any.
    pub fn question(&self) -> Option<&InputRequest> {
        match &self.body {
            ResponseBody::Question(q) => Some(q),
            _ => None,
        }
    }

    /// Error, if any.
    pub fn error(&self) -> Option<&AgentError> {
        match &self.body {
            ResponseBody::Error(e) => Some(e),
            _ => None,
        }
    }
}
