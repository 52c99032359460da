//! The boundary between the engine and whatever actually talks to agents.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{codes, Recovery};
use crate::ids::WorkId;
use crate::protocol::{AgentConfig, AgentResponse, TurnRequest};

/// Transport-level failures, classified for retry decisions.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    // Transient
    /// No answer within the deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),
    /// The agent asked us to slow down.
    #[error("rate limited")]
    RateLimited {
        /// Delay the agent asked for, if any.
        retry_after: Option<Duration>,
    },
    /// 5xx or an open circuit breaker.
    #[error("service unavailable ({status}): {body}")]
    Unavailable {
        /// HTTP status.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    // Caller must change something
    /// Credentials were refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The agent rejected the request shape.
    #[error("invalid request ({status}): {body}")]
    InvalidRequest {
        /// HTTP status.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    // Agent misbehaved
    /// The reply could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },
    /// The agent's protocol or method is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether resending the same turn may succeed.
    ///
    /// Timeouts are not retryable: the turn may already have reached the agent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::Unavailable { .. }
        )
    }

    /// Server-suggested wait before retrying.
    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Stable code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => codes::TIMEOUT,
            Self::Network(_) => codes::NETWORK_ERROR,
            Self::RateLimited { .. } => codes::RATE_LIMITED,
            Self::Unavailable { .. } => codes::SERVICE_UNAVAILABLE,
            Self::Unauthorized(_) => codes::AUTH_FAILED,
            Self::InvalidRequest { .. } => codes::INVALID_REQUEST,
            Self::InvalidResponse(_) => codes::INVALID_RESPONSE,
            Self::Rpc { .. } => codes::RPC_ERROR,
            Self::Unsupported(_) => codes::UNSUPPORTED,
        }
    }

    /// Recovery class for this failure.
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::Timeout(_)
            | Self::Network(_)
            | Self::RateLimited { .. }
            | Self::Unavailable { .. } => Recovery::Transient,
            Self::InvalidRequest { .. } | Self::Rpc { .. } => Recovery::Correctable,
            Self::Unauthorized(_) | Self::InvalidResponse(_) | Self::Unsupported(_) => {
                Recovery::Terminal
            }
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::Unavailable { status, body },
            _ => Self::InvalidRequest { status, body },
        }
    }
}

/// One agent-facing transport. Synchronous per turn.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Send one turn and wait for the agent's response to it.
    async fn call(
        &self,
        agent: &AgentConfig,
        request: &TurnRequest,
    ) -> Result<AgentResponse, TransportError>;

    /// Poll the current state of deferred work.
    async fn task_status(
        &self,
        agent: &AgentConfig,
        work_id: &WorkId,
    ) -> Result<AgentResponse, TransportError> {
        let _ = (agent, work_id);
        Err(TransportError::Unsupported(format!(
            "{} cannot poll task status",
            self.name()
        )))
    }
}
