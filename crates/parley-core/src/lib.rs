//! # parley-core
//!
//! Shared vocabulary for the parley orchestration crates.
//!
//! - **Branded IDs**: [`OperationId`], [`AgentId`], [`ConversationId`], [`WorkId`]
//! - **Task lifecycle**: [`TaskState`] and the [`TaskLifecycle`] state machine
//! - **Errors**: the [`Recovery`] taxonomy, [`TaskError`], and [`OrchestrationError`]
//! - **Protocol**: agent configuration, turn requests, agent responses, notifications
//! - **Outcomes**: per-agent [`AgentOutcome`] and raw [`Settled`] results
//! - **Transport boundary**: the [`AgentTransport`] trait and [`TransportError`]

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod notification;
pub mod outcome;
pub mod protocol;
pub mod task;
pub mod transport;

pub use errors::{codes, OrchestrationError, Recovery, TaskError};
pub use ids::{AgentId, ConversationId, OperationId, WorkId};
pub use notification::Notification;
pub use outcome::{AgentOutcome, OutcomeMetadata, OutcomeStatus, Settled};
pub use protocol::{
    AgentConfig, AgentError, AgentProtocol, AgentResponse, InputRequest, ResponseBody, TurnRequest,
};
pub use task::{TaskLifecycle, TaskState, Transition};
pub use transport::{AgentTransport, TransportError};
