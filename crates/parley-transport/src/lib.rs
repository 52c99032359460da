//! # parley-transport
//!
//! Implementations of [`parley_core::AgentTransport`].
//!
//! - [`HttpTransport`]: JSON-RPC 2.0 over HTTP (`message/send` for A2A
//!   agents, `tools/call` for MCP agents)
//! - [`RetryingTransport`]: backoff + circuit breaker around any transport
//! - [`ScriptedTransport`]: deterministic double for tests

#![deny(unsafe_code)]

pub mod http;
pub mod mock;
pub mod reliable;
pub mod wire;

pub use http::{HttpTransport, HttpTransportConfig};
pub use mock::{ScriptedTransport, ScriptedTurn};
pub use reliable::{RetryConfig, RetryingTransport};
