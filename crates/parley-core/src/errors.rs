//! Error codes, recovery classes, and the engine error type.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskState;
use crate::transport::TransportError;

/// Stable error codes surfaced to callers.
pub mod codes {
    #![allow(missing_docs)]

    pub const TIMEOUT: &str = "TIMEOUT";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
    pub const RPC_ERROR: &str = "RPC_ERROR";
    pub const UNSUPPORTED: &str = "UNSUPPORTED";
    pub const NO_AGENTS: &str = "NO_AGENTS";
    pub const CLARIFICATION_LIMIT_EXCEEDED: &str = "CLARIFICATION_LIMIT_EXCEEDED";
    pub const INPUT_DEFERRED: &str = "INPUT_DEFERRED";
    pub const INPUT_REJECTED: &str = "INPUT_REJECTED";
    pub const NO_INPUT_HANDLER: &str = "NO_INPUT_HANDLER";
    pub const TASK_FAILED: &str = "TASK_FAILED";
    pub const TASK_REJECTED: &str = "TASK_REJECTED";
    pub const CANCELED: &str = "CANCELED";
    pub const UNKNOWN_CORRELATION: &str = "UNKNOWN_CORRELATION";
    pub const CORRELATION_MISMATCH: &str = "CORRELATION_MISMATCH";
    pub const ALREADY_TERMINAL: &str = "ALREADY_TERMINAL";
    pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";
    pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
    pub const STORE_ERROR: &str = "STORE_ERROR";
    pub const AGENT_PANICKED: &str = "AGENT_PANICKED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
    pub const INVALID_NOTIFICATION: &str = "INVALID_NOTIFICATION";
}

/// How a caller should react to a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recovery {
    /// Retry with backoff.
    Transient,
    /// Change the request before retrying.
    Correctable,
    /// Will not succeed without external intervention.
    Terminal,
}

impl Recovery {
    /// Classify an error code reported by a remote agent.
    pub fn classify_code(code: &str) -> Self {
        let upper = code.to_ascii_uppercase();
        let has = |needle: &str| upper.contains(needle);
        if has("AUTH") || has("ACCOUNT") || has("FORBIDDEN") || has("PERMISSION") {
            Self::Terminal
        } else if has("RATE_LIMIT")
            || has("UNAVAILABLE")
            || has("TIMEOUT")
            || has("NETWORK")
            || has("OVERLOAD")
        {
            Self::Transient
        } else {
            Self::Correctable
        }
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Correctable => "correctable",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure carried by outcomes and settle results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Stable machine-readable code, e.g. `TIMEOUT`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// How the caller should react.
    pub recovery: Recovery,
    /// Extra structured context from the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    /// Error with an explicit recovery class.
    pub fn new(code: impl Into<String>, message: impl Into<String>, recovery: Recovery) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery,
            details: None,
        }
    }

    /// Build from an agent-reported code, classifying it when the agent did
    /// not say how to recover.
    pub fn from_agent(code: &str, message: impl Into<String>, recovery: Option<Recovery>) -> Self {
        Self::new(
            code,
            message,
            recovery.unwrap_or_else(|| Recovery::classify_code(code)),
        )
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether retrying unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        self.recovery == Recovery::Transient
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.recovery, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<OrchestrationError> for TaskError {
    fn from(err: OrchestrationError) -> Self {
        err.to_task_error()
    }
}

impl From<TransportError> for TaskError {
    fn from(err: TransportError) -> Self {
        Self::new(err.code(), err.to_string(), err.recovery())
    }
}

/// Everything the engine can fail with.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// The agent list was empty.
    #[error("no agents configured")]
    NoAgents,
    /// The transport failed before the agent answered.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A turn exceeded its timeout.
    #[error("turn timed out after {0:?}")]
    Timeout(Duration),
    /// The agent asked more questions than allowed.
    #[error("clarification limit of {max} rounds exceeded")]
    ClarificationLimit {
        /// Configured round limit.
        max: u32,
    },
    /// The resolver declined to answer now.
    #[error("input deferred by resolver")]
    InputDeferred,
    /// The resolver refused the question.
    #[error("input rejected: {0}")]
    InputRejected(String),
    /// Input was requested with no resolver available.
    #[error("agent requested input but no resolver is configured")]
    NoInputHandler,
    /// The agent reported the task failed.
    #[error("agent reported failure: {0}")]
    AgentFailed(TaskError),
    /// The agent refused the task.
    #[error("agent rejected the task: {0}")]
    AgentRejected(String),
    /// Canceled locally or by the agent.
    #[error("canceled")]
    Canceled,
    /// A notification matched no pending operation.
    #[error("no pending operation matches the notification")]
    UnknownCorrelation,
    /// Notification ids disagree with the registry.
    #[error("correlation mismatch: {0}")]
    CorrelationMismatch(String),
    /// A state update arrived after the task finished.
    #[error("task already terminal ({0})")]
    AlreadyTerminal(TaskState),
    /// The agent reported an impossible state change.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Local state.
        from: TaskState,
        /// State the agent reported.
        to: TaskState,
    },
    /// The agent broke the turn protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The pending store failed.
    #[error("store error: {0}")]
    Store(String),
    /// A fanned-out agent task panicked.
    #[error("agent task panicked: {0}")]
    Panicked(String),
    /// A bug in the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    /// Stable code string.
    pub fn code(&self) -> &str {
        match self {
            Self::NoAgents => codes::NO_AGENTS,
            Self::Transport(e) => e.code(),
            Self::Timeout(_) => codes::TIMEOUT,
            Self::ClarificationLimit { .. } => codes::CLARIFICATION_LIMIT_EXCEEDED,
            Self::InputDeferred => codes::INPUT_DEFERRED,
            Self::InputRejected(_) => codes::INPUT_REJECTED,
            Self::NoInputHandler => codes::NO_INPUT_HANDLER,
            Self::AgentFailed(e) => &e.code,
            Self::AgentRejected(_) => codes::TASK_REJECTED,
            Self::Canceled => codes::CANCELED,
            Self::UnknownCorrelation => codes::UNKNOWN_CORRELATION,
            Self::CorrelationMismatch(_) => codes::CORRELATION_MISMATCH,
            Self::AlreadyTerminal(_) => codes::ALREADY_TERMINAL,
            Self::InvalidTransition { .. } => codes::INVALID_TRANSITION,
            Self::ProtocolViolation(_) => codes::PROTOCOL_VIOLATION,
            Self::Store(_) => codes::STORE_ERROR,
            Self::Panicked(_) => codes::AGENT_PANICKED,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// How the caller should react to this error.
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::Transport(e) => e.recovery(),
            Self::AgentFailed(e) => e.recovery,
            Self::Timeout(_) | Self::Store(_) => Recovery::Transient,
            Self::ClarificationLimit { .. }
            | Self::InputDeferred
            | Self::InputRejected(_)
            | Self::NoInputHandler
            | Self::AgentRejected(_)
            | Self::NoAgents
            | Self::UnknownCorrelation
            | Self::CorrelationMismatch(_)
            | Self::AlreadyTerminal(_) => Recovery::Correctable,
            Self::Canceled
            | Self::InvalidTransition { .. }
            | Self::ProtocolViolation(_)
            | Self::Panicked(_)
            | Self::Internal(_) => Recovery::Terminal,
        }
    }

    /// Flatten into the serializable form used in outcomes.
    pub fn to_task_error(&self) -> TaskError {
        match self {
            Self::AgentFailed(e) => e.clone(),
            other => TaskError::new(other.code(), other.to_string(), other.recovery()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_agent_codes() {
        assert_eq!(Recovery::classify_code("AUTH_REQUIRED"), Recovery::Terminal);
        assert_eq!(Recovery::classify_code("account_suspended"), Recovery::Terminal);
        assert_eq!(Recovery::classify_code("RATE_LIMITED"), Recovery::Transient);
        assert_eq!(Recovery::classify_code("SERVICE_UNAVAILABLE"), Recovery::Transient);
        assert_eq!(Recovery::classify_code("TIMEOUT"), Recovery::Transient);
        assert_eq!(Recovery::classify_code("BUDGET_TOO_LOW"), Recovery::Correctable);
    }

    #[test]
    fn explicit_recovery_wins() {
        let e = TaskError::from_agent("BUDGET_TOO_LOW", "min 1000", Some(Recovery::Terminal));
        assert_eq!(e.recovery, Recovery::Terminal);
        let e = TaskError::from_agent("BUDGET_TOO_LOW", "min 1000", None);
        assert_eq!(e.recovery, Recovery::Correctable);
    }

    #[test]
    fn clarification_failures_are_correctable() {
        for err in [
            OrchestrationError::ClarificationLimit { max: 1 },
            OrchestrationError::InputDeferred,
            OrchestrationError::InputRejected("no".into()),
            OrchestrationError::NoInputHandler,
        ] {
            assert_eq!(err.recovery(), Recovery::Correctable, "{err}");
        }
    }

    #[test]
    fn timeout_is_transient() {
        let err = OrchestrationError::Timeout(Duration::from_secs(30));
        assert_eq!(err.code(), codes::TIMEOUT);
        assert!(err.to_task_error().is_retryable());
    }

    #[test]
    fn agent_failure_keeps_agent_code() {
        let inner = TaskError::from_agent("INVENTORY_GONE", "sold out", None);
        let err = OrchestrationError::AgentFailed(inner.clone());
        assert_eq!(err.code(), "INVENTORY_GONE");
        assert_eq!(err.to_task_error(), inner);
    }

    #[test]
    fn task_error_serializes_lowercase_recovery() {
        let e = TaskError::new(codes::CANCELED, "stop", Recovery::Terminal);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["recovery"], "terminal");
        assert!(json.get("details").is_none());
    }
}
