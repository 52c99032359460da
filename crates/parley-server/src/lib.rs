//! # parley-server
//!
//! Axum receiver for agents' asynchronous notifications.
//!
//! - `POST /webhooks/{task_type}/{agent_id}/{operation_id}` and `POST /webhooks`:
//!   verify the HMAC signature, correlate, resume the suspended task
//! - `GET /health`, `GET /metrics`
//! - Every resumed outcome is published on a `tokio::sync::broadcast` channel

#![deny(unsafe_code)]

pub mod health;
pub mod metrics;
pub mod server;
pub mod webhook;

pub use server::{AppState, ServerConfig, ServerError, WebhookServer};
pub use webhook::WebhookReply;
