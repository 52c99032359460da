//! Notification handlers.
//!
//! Raw body → JSON → signature check → [`Notification`] → executor resume.
//! The signature covers the canonical form of the parsed body, so the
//! body must be JSON before it can be verified.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use parley_core::{codes, AgentId, AgentOutcome, Notification, OperationId, OrchestrationError, Recovery};

use crate::metrics::{BROADCAST_UNOBSERVED_TOTAL, NOTIFICATIONS_TOTAL, NOTIFICATION_DURATION_SECONDS};
use crate::server::AppState;

/// Response body for every notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookReply {
    /// The task was resumed; `outcome` is where it stands now.
    Accepted { outcome: AgentOutcome },
    /// Nothing is waiting for this notification. Senders should not retry.
    Ignored { reason: String },
    /// The notification was refused.
    Rejected {
        /// Stable error code.
        code: String,
        /// Whether resending could help.
        recovery: Recovery,
        /// Human-readable reason.
        message: String,
    },
}

impl WebhookReply {
    fn rejected(code: &str, recovery: Recovery, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.to_string(),
            recovery,
            message: message.into(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Ignored { .. } => "ignored",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Ids a notification may carry outside its body.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Route {
    /// Task name.
    pub task_type: Option<String>,
    /// Sending agent.
    pub agent_id: Option<String>,
    /// Operation id.
    pub operation_id: Option<String>,
}

pub(crate) async fn receive_with_path(
    State(state): State<AppState>,
    Path((task_type, agent_id, operation_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = Route {
        task_type: Some(task_type),
        agent_id: Some(agent_id),
        operation_id: Some(operation_id),
    };
    receive(&state, route, &headers, &body).await
}

pub(crate) async fn receive_with_query(
    State(state): State<AppState>,
    Query(route): Query<Route>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(&state, route, &headers, &body).await
}

async fn receive(state: &AppState, route: Route, headers: &HeaderMap, body: &[u8]) -> Response {
    let started = Instant::now();
    let (status, reply) = handle(state, route, headers, body).await;
    ::metrics::counter!(NOTIFICATIONS_TOTAL, "result" => reply.label()).increment(1);
    ::metrics::histogram!(NOTIFICATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    (status, Json(reply)).into_response()
}

#[instrument(skip_all, fields(task_type = route.task_type.as_deref(), operation_id = route.operation_id.as_deref(), agent_id = route.agent_id.as_deref()))]
async fn handle(state: &AppState, route: Route, headers: &HeaderMap, body: &[u8]) -> (StatusCode, WebhookReply) {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "notification body is not JSON");
            return (
                StatusCode::BAD_REQUEST,
                WebhookReply::rejected(codes::INVALID_NOTIFICATION, Recovery::Correctable, format!("body is not JSON: {e}")),
            );
        }
    };

    let signature = header_str(headers, &state.config.signature_header);
    let timestamp = header_str(headers, &state.config.timestamp_header);
    if !state.verifier.verify_headers(&payload, signature, timestamp) {
        warn!(
            has_signature = signature.is_some(),
            has_timestamp = timestamp.is_some(),
            "notification failed signature verification"
        );
        return (
            StatusCode::UNAUTHORIZED,
            WebhookReply::rejected(codes::INVALID_SIGNATURE, Recovery::Terminal, "signature verification failed"),
        );
    }

    let notification: Notification = match serde_json::from_value(payload) {
        Ok(n) => n,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                WebhookReply::rejected(codes::INVALID_NOTIFICATION, Recovery::Correctable, e.to_string()),
            );
        }
    };
    let notification = notification.with_route(
        route.task_type,
        route.operation_id.map(OperationId::from_raw),
        route.agent_id.map(AgentId::from_raw),
    );

    match state.executor.resume(notification).await {
        Ok(outcome) => {
            info!(status = ?outcome.status, success = outcome.success, "notification resumed task");
            if state.outcomes.send(outcome.clone()).is_err() {
                ::metrics::counter!(BROADCAST_UNOBSERVED_TOTAL).increment(1);
            }
            (StatusCode::OK, WebhookReply::Accepted { outcome })
        }
        Err(OrchestrationError::UnknownCorrelation) => {
            info!("notification matches no pending operation; ignoring");
            (
                StatusCode::OK,
                WebhookReply::Ignored {
                    reason: OrchestrationError::UnknownCorrelation.to_string(),
                },
            )
        }
        Err(e) => {
            let recovery = e.recovery();
            let status = if recovery == Recovery::Correctable {
                StatusCode::CONFLICT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            warn!(code = e.code(), error = %e, "notification could not be applied");
            (status, WebhookReply::rejected(e.code(), recovery, e.to_string()))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
