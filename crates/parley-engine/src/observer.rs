//! Observer hooks for protocol turns.
//!
//! Observers see every turn sent, response received, and state change.
//! They never influence control flow: an `Err` is logged at debug level and
//! a panic is caught and logged at warn level.

use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use parley_core::{ConversationId, OutcomeStatus, TaskState, Transition, WorkId};

use crate::correlation::CorrelationKey;

/// Turns sent to agents (counter, labels: agent).
pub const TURNS_TOTAL: &str = "parley_turns_total";
/// Round-trip time of one turn (histogram, labels: agent).
pub const TURN_DURATION_SECONDS: &str = "parley_turn_duration_seconds";
/// Lifecycle transitions applied (counter, labels: from, to).
pub const STATE_TRANSITIONS_TOTAL: &str = "parley_state_transitions_total";
/// Clarification rounds answered (counter, labels: agent).
pub const CLARIFICATIONS_TOTAL: &str = "parley_clarifications_total";
/// Runs suspended awaiting deferred completion (counter).
pub const SUSPENDED_TOTAL: &str = "parley_suspended_total";
/// Suspended runs resumed (counter).
pub const RESUMED_TOTAL: &str = "parley_resumed_total";
/// Finished runs (counter, labels: status, code).
pub const OUTCOMES_TOTAL: &str = "parley_outcomes_total";
/// Wall time of one run or resume (histogram, labels: status).
pub const RUN_DURATION_SECONDS: &str = "parley_run_duration_seconds";

/// Lifecycle events emitted by the executor, in order, per pair.
#[derive(Clone, Debug)]
pub enum TaskEvent {
    /// A turn is about to go out.
    TurnSent {
        /// Pair the event belongs to.
        key: CorrelationKey,
        /// 1-based turn number within this run.
        turn: u32,
        /// Whether the turn answers a question.
        has_input: bool,
    },
    /// The agent answered a turn.
    ResponseReceived {
        /// Pair the event belongs to.
        key: CorrelationKey,
        /// Reported state.
        status: TaskState,
        /// Turn round-trip time.
        elapsed: Duration,
    },
    /// The local lifecycle moved.
    StateChanged {
        /// Pair the event belongs to.
        key: CorrelationKey,
        /// The applied transition.
        transition: Transition,
    },
    /// A resolver answered a question.
    ClarificationAnswered {
        /// Pair the event belongs to.
        key: CorrelationKey,
        /// 1-based round number.
        round: u32,
        /// Question that was answered.
        question: String,
    },
    /// The task was persisted to wait for a notification.
    Suspended {
        /// Pair the event belongs to.
        key: CorrelationKey,
        /// Deferred-work id to correlate by.
        work_id: Option<WorkId>,
        /// Conversation id to correlate by.
        conversation_id: Option<ConversationId>,
    },
    /// A notification picked the task back up.
    Resumed {
        /// Pair the event belongs to.
        key: CorrelationKey,
        /// State the notification reported.
        status: TaskState,
    },
    /// A run or resume returned an outcome.
    Finished {
        /// Pair the event belongs to.
        key: CorrelationKey,
        /// Outcome status.
        status: OutcomeStatus,
        /// Error code when failed.
        error_code: Option<String>,
        /// Time spent in this entry point.
        duration: Duration,
    },
}

impl TaskEvent {
    /// Pair the event belongs to.
    pub fn key(&self) -> &CorrelationKey {
        match self {
            Self::TurnSent { key, .. }
            | Self::ResponseReceived { key, .. }
            | Self::StateChanged { key, .. }
            | Self::ClarificationAnswered { key, .. }
            | Self::Suspended { key, .. }
            | Self::Resumed { key, .. }
            | Self::Finished { key, .. } => key,
        }
    }

    /// Stable snake_case name, used as a metric label.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TurnSent { .. } => "turn_sent",
            Self::ResponseReceived { .. } => "response_received",
            Self::StateChanged { .. } => "state_changed",
            Self::ClarificationAnswered { .. } => "clarification_answered",
            Self::Suspended { .. } => "suspended",
            Self::Resumed { .. } => "resumed",
            Self::Finished { .. } => "finished",
        }
    }
}

/// Receives every [`TaskEvent`]. Errors and panics are logged and dropped.
pub trait TaskObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &TaskEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Deliver an event, isolating the caller from whatever the observer does.
pub(crate) fn notify(observer: &dyn TaskObserver, event: &TaskEvent) {
    match catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(event = event.name(), error = %e, "observer returned error"),
        Err(panic) => {
            let msg = panic_message(&*panic);
            warn!(event = event.name(), panic = %msg, "observer panicked");
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl TaskObserver for TracingObserver {
    fn on_event(&self, event: &TaskEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        let key = event.key();
        match event {
            TaskEvent::TurnSent { turn, has_input, .. } => {
                debug!(operation_id = %key.operation_id, agent_id = %key.agent_id, turn, has_input, "turn sent");
            }
            TaskEvent::ResponseReceived { status, elapsed, .. } => {
                debug!(
                    operation_id = %key.operation_id,
                    agent_id = %key.agent_id,
                    status = %status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "response received"
                );
            }
            TaskEvent::StateChanged { transition, .. } => {
                debug!(
                    operation_id = %key.operation_id,
                    agent_id = %key.agent_id,
                    from = %transition.from,
                    to = %transition.to,
                    "state changed"
                );
            }
            TaskEvent::ClarificationAnswered { round, question, .. } => {
                info!(operation_id = %key.operation_id, agent_id = %key.agent_id, round, question, "clarification answered");
            }
            TaskEvent::Suspended { work_id, conversation_id, .. } => {
                info!(
                    operation_id = %key.operation_id,
                    agent_id = %key.agent_id,
                    work_id = ?work_id,
                    conversation_id = ?conversation_id,
                    "task suspended awaiting notification"
                );
            }
            TaskEvent::Resumed { status, .. } => {
                info!(operation_id = %key.operation_id, agent_id = %key.agent_id, status = %status, "task resumed");
            }
            TaskEvent::Finished { status, error_code, duration, .. } => {
                info!(
                    operation_id = %key.operation_id,
                    agent_id = %key.agent_id,
                    status = ?status,
                    error_code = error_code.as_deref(),
                    duration_ms = duration.as_millis() as u64,
                    "task finished"
                );
            }
        }
        Ok(())
    }
}

/// Records counters and histograms through the `metrics` facade.
#[derive(Debug, Default)]
pub struct MetricsObserver;

impl TaskObserver for MetricsObserver {
    fn on_event(&self, event: &TaskEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        let agent = event.key().agent_id.to_string();
        match event {
            TaskEvent::TurnSent { .. } => {
                metrics::counter!(TURNS_TOTAL, "agent" => agent).increment(1);
            }
            TaskEvent::ResponseReceived { elapsed, .. } => {
                metrics::histogram!(TURN_DURATION_SECONDS, "agent" => agent).record(elapsed.as_secs_f64());
            }
            TaskEvent::StateChanged { transition, .. } => {
                metrics::counter!(
                    STATE_TRANSITIONS_TOTAL,
                    "from" => transition.from.as_str(),
                    "to" => transition.to.as_str()
                )
                .increment(1);
            }
            TaskEvent::ClarificationAnswered { .. } => {
                metrics::counter!(CLARIFICATIONS_TOTAL, "agent" => agent).increment(1);
            }
            TaskEvent::Suspended { .. } => {
                metrics::counter!(SUSPENDED_TOTAL).increment(1);
            }
            TaskEvent::Resumed { .. } => {
                metrics::counter!(RESUMED_TOTAL).increment(1);
            }
            TaskEvent::Finished { status, error_code, duration, .. } => {
                let status = match status {
                    OutcomeStatus::Completed => "completed",
                    OutcomeStatus::Pending => "pending",
                    OutcomeStatus::Failed => "failed",
                };
                let code = error_code.clone().unwrap_or_else(|| "none".to_string());
                metrics::counter!(OUTCOMES_TOTAL, "status" => status, "code" => code).increment(1);
                metrics::histogram!(RUN_DURATION_SECONDS, "status" => status).record(duration.as_secs_f64());
            }
        }
        Ok(())
    }
}

/// Forwards each event to every inner observer, isolating them from each other.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn TaskObserver>>,
}

impl CompositeObserver {
    /// Fan events out to every observer in order.
    pub fn new(observers: Vec<Arc<dyn TaskObserver>>) -> Self {
        Self { observers }
    }

    /// Append an observer.
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl TaskObserver for CompositeObserver {
    fn on_event(&self, event: &TaskEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        for observer in &self.observers {
            notify(observer.as_ref(), event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use parley_core::{AgentId, OperationId};

    fn key() -> CorrelationKey {
        CorrelationKey::new(OperationId::from_raw("op_1"), AgentId::from_raw("a1"))
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<&'static str>>);

    impl TaskObserver for Recording {
        fn on_event(&self, event: &TaskEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.0.lock().push(event.name());
            Ok(())
        }
    }

    struct Failing;

    impl TaskObserver for Failing {
        fn on_event(&self, _event: &TaskEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
            Err("boom".into())
        }
    }

    struct Panicking;

    impl TaskObserver for Panicking {
        fn on_event(&self, _event: &TaskEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
            panic!("observer exploded")
        }
    }

    #[test]
    fn failures_are_swallowed() {
        let event = TaskEvent::Resumed {
            key: key(),
            status: TaskState::Completed,
        };
        notify(&Failing, &event);
        notify(&Panicking, &event);
    }

    #[test]
    fn composite_isolates_observers() {
        let recording = Arc::new(Recording::default());
        let composite = CompositeObserver::new(vec![Arc::new(Panicking), Arc::new(Failing)])
            .with(recording.clone());
        let event = TaskEvent::TurnSent {
            key: key(),
            turn: 1,
            has_input: false,
        };
        assert!(composite.on_event(&event).is_ok());
        assert_eq!(*recording.0.lock(), vec!["turn_sent"]);
    }

    #[test]
    fn builtin_observers_accept_every_event() {
        let events = vec![
            TaskEvent::TurnSent { key: key(), turn: 1, has_input: true },
            TaskEvent::ResponseReceived {
                key: key(),
                status: TaskState::Working,
                elapsed: Duration::from_millis(12),
            },
            TaskEvent::ClarificationAnswered { key: key(), round: 1, question: "budget?".into() },
            TaskEvent::Suspended { key: key(), work_id: Some(WorkId::from_raw("w1")), conversation_id: None },
            TaskEvent::Resumed { key: key(), status: TaskState::Completed },
            TaskEvent::Finished {
                key: key(),
                status: OutcomeStatus::Failed,
                error_code: Some("TIMEOUT".into()),
                duration: Duration::from_secs(1),
            },
        ];
        for event in &events {
            assert!(TracingObserver.on_event(event).is_ok());
            assert!(MetricsObserver.on_event(event).is_ok());
            assert_eq!(event.key(), &key());
        }
    }

    #[test]
    fn panic_messages() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*owned), "owned");
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("borrowed");
        assert_eq!(panic_message(&*borrowed), "borrowed");
        let other: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*other), "unknown panic");
    }
}
