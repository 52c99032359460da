//! Single-agent task executor.
//!
//! Drives one task against one agent: send, interpret the reported state,
//! answer clarification questions through an [`InputResolver`], and either
//! finish or suspend on deferred work. Suspension is a persisted
//! [`PendingOperation`]; [`TaskExecutor::resume`] is the separate entry
//! point that picks it back up when a notification arrives.
//!
//! Turns for one `(operation, agent)` pair are strictly sequential: every
//! entry point holds that pair's turn lock for its whole duration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use parley_core::{
    codes, AgentConfig, AgentId, AgentOutcome, AgentResponse, AgentTransport, ConversationId,
    InputRequest, Notification, OperationId, OrchestrationError, OutcomeMetadata, OutcomeStatus,
    Recovery, ResponseBody, TaskError, TaskLifecycle, TaskState, TurnRequest, WorkId,
};
use parley_webhook::CallbackUrlTemplate;

use crate::correlation::{CorrelationKey, CorrelationRegistry};
use crate::observer::{self, TaskEvent, TaskObserver, TracingObserver};
use crate::pagination::{collect_all, page_from_value, PageRequest, PaginationOptions};
use crate::pending::{InMemoryPendingStore, PendingOperation, PendingStore};
use crate::resolver::{InputContext, InputDecision, InputResolver};

/// What happens to registry entries and pending records once a task ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CleanupPolicy {
    /// Remove them as soon as the task is terminal.
    #[default]
    OnTerminal,
    /// Keep them (with the final outcome) until [`TaskExecutor::close`].
    /// Duplicate notifications then get the recorded outcome back.
    Manual,
}

/// Executor-wide defaults.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Deadline for one agent turn.
    pub turn_timeout: Duration,
    /// Questions answered per run before giving up.
    pub max_clarification_rounds: u32,
    /// When registry and store entries are dropped.
    pub cleanup: CleanupPolicy,
    /// Push-notification URL handed to agents on every turn.
    pub callback_url: Option<CallbackUrlTemplate>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(30),
            max_clarification_rounds: 3,
            cleanup: CleanupPolicy::OnTerminal,
            callback_url: None,
        }
    }
}

/// One named task invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRequest {
    /// Task name sent as the turn operation.
    pub task: String,
    /// Task arguments.
    pub args: Value,
    /// Generated when absent.
    pub operation_id: Option<OperationId>,
}

impl TaskRequest {
    /// Request with a generated operation id.
    pub fn new(task: impl Into<String>, args: Value) -> Self {
        Self {
            task: task.into(),
            args,
            operation_id: None,
        }
    }

    /// Use an existing operation id.
    #[must_use]
    pub fn with_operation_id(mut self, id: OperationId) -> Self {
        self.operation_id = Some(id);
        self
    }
}

/// Per-call overrides.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Takes precedence over the executor's resolver.
    pub resolver: Option<Arc<dyn InputResolver>>,
    /// Cancels the run between or during turns.
    pub cancel: CancellationToken,
    /// Overrides the executor's round limit.
    pub max_clarification_rounds: Option<u32>,
    /// Overrides the executor's turn timeout.
    pub turn_timeout: Option<Duration>,
}

impl RunOptions {
    /// Resolver for this run only.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Cancel through this token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the round limit.
    #[must_use]
    pub fn with_max_clarification_rounds(mut self, max: u32) -> Self {
        self.max_clarification_rounds = Some(max);
        self
    }

    /// Override the turn timeout.
    #[must_use]
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = Some(timeout);
        self
    }
}

/// Where a run stopped without error.
enum Halt {
    Completed(Value),
    Suspended,
}

enum Next {
    Send(TurnRequest),
    Halt(Halt),
}

/// Mutable state of one run or resume.
struct RunState {
    agent: AgentConfig,
    key: CorrelationKey,
    task: String,
    args: Value,
    lifecycle: TaskLifecycle,
    rounds: u32,
    max_rounds: u32,
    conversation_id: Option<ConversationId>,
    work_id: Option<WorkId>,
    last_request: TurnRequest,
    started_at: DateTime<Utc>,
    clock: Instant,
    turns: u32,
}

impl RunState {
    fn from_record(record: PendingOperation, max_override: Option<u32>) -> Self {
        let key = record.key();
        Self {
            key,
            task: record.task,
            args: record.args,
            lifecycle: TaskLifecycle::resume_at(record.state),
            rounds: record.clarification_rounds,
            max_rounds: max_override.unwrap_or(record.max_clarification_rounds),
            conversation_id: record.conversation_id,
            work_id: record.work_id,
            last_request: record.last_request,
            started_at: record.started_at,
            clock: Instant::now(),
            turns: 0,
            agent: record.agent,
        }
    }

    fn metadata(&self) -> OutcomeMetadata {
        let mut meta = OutcomeMetadata::new(&self.agent);
        meta.operation_id = Some(self.key.operation_id.clone());
        meta.task = Some(self.task.clone());
        meta.started_at = self.started_at;
        meta.final_state = Some(self.lifecycle.state());
        meta.clarification_rounds = self.rounds;
        meta.conversation_id = self.conversation_id.clone();
        meta.work_id = self.work_id.clone();
        meta.finish()
    }

    fn record(&self, final_outcome: Option<AgentOutcome>) -> PendingOperation {
        PendingOperation {
            operation_id: self.key.operation_id.clone(),
            agent: self.agent.clone(),
            task: self.task.clone(),
            args: self.args.clone(),
            last_request: self.last_request.clone(),
            conversation_id: self.conversation_id.clone(),
            work_id: self.work_id.clone(),
            state: self.lifecycle.state(),
            clarification_rounds: self.rounds,
            max_clarification_rounds: self.max_rounds,
            started_at: self.started_at,
            updated_at: Utc::now(),
            final_outcome,
        }
    }
}

/// Runs tasks against single agents.
pub struct TaskExecutor {
    transport: Arc<dyn AgentTransport>,
    registry: Arc<CorrelationRegistry>,
    store: Arc<dyn PendingStore>,
    observer: Arc<dyn TaskObserver>,
    resolver: Option<Arc<dyn InputResolver>>,
    config: ExecutorConfig,
    turn_locks: DashMap<CorrelationKey, Arc<AsyncMutex<()>>>,
}

impl TaskExecutor {
    /// Executor with an in-memory store, tracing observer, and no resolver.
    pub fn new(transport: Arc<dyn AgentTransport>, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            transport,
            registry,
            store: Arc::new(InMemoryPendingStore::new()),
            observer: Arc::new(TracingObserver),
            resolver: None,
            config: ExecutorConfig::default(),
            turn_locks: DashMap::new(),
        }
    }

    /// Store suspended runs here.
    #[must_use]
    pub fn with_pending_store(mut self, store: Arc<dyn PendingStore>) -> Self {
        self.store = store;
        self
    }

    /// Send lifecycle events here.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Default resolver for runs that bring none.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the defaults.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry used to correlate notifications.
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Current defaults.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a task to completion, failure, or suspension. Never errors: every
    /// failure is a classified failed outcome.
    #[instrument(skip_all, fields(operation_id = tracing::field::Empty, agent_id = %agent.id, task = %request.task))]
    pub async fn run(&self, agent: &AgentConfig, request: TaskRequest, options: RunOptions) -> AgentOutcome {
        let operation_id = request.operation_id.unwrap_or_default();
        let _ = Span::current().record("operation_id", tracing::field::display(&operation_id));

        let key = CorrelationKey::new(operation_id.clone(), agent.id.clone());
        let lock = self.turn_lock(&key);
        let _guard = lock.lock().await;

        let mut first = TurnRequest::initial(operation_id.clone(), request.task.clone(), request.args.clone());
        if let Some(template) = &self.config.callback_url {
            first = first.with_callback_url(template.render(
                &request.task,
                agent.id.as_str(),
                operation_id.as_str(),
            ));
        }

        let mut state = RunState {
            agent: agent.clone(),
            key,
            task: request.task,
            args: request.args,
            lifecycle: TaskLifecycle::new(),
            rounds: 0,
            max_rounds: options
                .max_clarification_rounds
                .unwrap_or(self.config.max_clarification_rounds),
            conversation_id: None,
            work_id: None,
            last_request: first.clone(),
            started_at: Utc::now(),
            clock: Instant::now(),
            turns: 0,
        };

        let result = self.drive(&mut state, Next::Send(first), &options).await;
        self.finish(state, result)
    }

    /// Continue a suspended task from an inbound notification.
    ///
    /// Errors only when the notification cannot be matched to a pending
    /// operation; everything after that is reported through the outcome.
    pub async fn resume(&self, notification: Notification) -> Result<AgentOutcome, OrchestrationError> {
        self.resume_with(notification, RunOptions::default()).await
    }

    /// [`resume`](Self::resume) with per-call overrides.
    #[instrument(skip_all, fields(status = %notification.status))]
    pub async fn resume_with(
        &self,
        notification: Notification,
        options: RunOptions,
    ) -> Result<AgentOutcome, OrchestrationError> {
        let key = self.correlate(&notification)?;
        let lock = self.turn_lock(&key);
        let _guard = lock.lock().await;

        // A concurrent turn may have finished the task while this one waited.
        let Some(record) = self.store.get(&key)? else {
            self.forget_lock(&key);
            return Err(OrchestrationError::UnknownCorrelation);
        };
        if let Some(outcome) = record.final_outcome {
            debug!(operation_id = %key.operation_id, agent_id = %key.agent_id, "duplicate notification for finished task");
            return Ok(outcome);
        }

        self.emit(TaskEvent::Resumed {
            key,
            status: notification.status,
        });
        let state = RunState::from_record(record, options.max_clarification_rounds);
        Ok(self.continue_with(state, notification.into_response(), &options).await)
    }

    /// Poll the agent once for deferred work and continue with its answer.
    /// A failed poll leaves the operation suspended.
    #[instrument(skip(self), fields(operation_id = %operation_id, agent_id = %agent_id))]
    pub async fn refresh(
        &self,
        operation_id: &OperationId,
        agent_id: &AgentId,
    ) -> Result<AgentOutcome, OrchestrationError> {
        let key = CorrelationKey::new(operation_id.clone(), agent_id.clone());
        let lock = self.turn_lock(&key);
        let _guard = lock.lock().await;

        let record = self.store.get(&key)?.ok_or(OrchestrationError::UnknownCorrelation)?;
        if let Some(outcome) = record.final_outcome {
            return Ok(outcome);
        }
        let work_id = record
            .work_id
            .clone()
            .ok_or_else(|| OrchestrationError::ProtocolViolation("no work id to poll".into()))?;

        let timeout = self.config.turn_timeout;
        let response = tokio::time::timeout(timeout, self.transport.task_status(&record.agent, &work_id))
            .await
            .map_err(|_| OrchestrationError::Timeout(timeout))??;

        let state = RunState::from_record(record, None);
        Ok(self.continue_with(state, response, &RunOptions::default()).await)
    }

    /// Cancel a suspended task locally. Nothing is sent to the agent.
    pub async fn cancel_pending(
        &self,
        operation_id: &OperationId,
        agent_id: &AgentId,
    ) -> Result<AgentOutcome, OrchestrationError> {
        let key = CorrelationKey::new(operation_id.clone(), agent_id.clone());
        let lock = self.turn_lock(&key);
        let _guard = lock.lock().await;

        let record = self.store.get(&key)?.ok_or(OrchestrationError::UnknownCorrelation)?;
        if let Some(outcome) = record.final_outcome {
            return Ok(outcome);
        }
        let state = RunState::from_record(record, None);
        Ok(self.finish(state, Err(OrchestrationError::Canceled)))
    }

    /// Drop everything held for a pair. Returns whether anything existed.
    pub fn close(&self, operation_id: &OperationId, agent_id: &AgentId) -> Result<bool, OrchestrationError> {
        let key = CorrelationKey::new(operation_id.clone(), agent_id.clone());
        let in_registry = self.registry.remove(operation_id, agent_id);
        let in_store = self.store.remove(&key)?;
        let _ = self.turn_locks.remove(&key);
        Ok(in_registry || in_store)
    }

    /// Every stored record, open or closed.
    pub fn pending(&self) -> Result<Vec<PendingOperation>, OrchestrationError> {
        Ok(self.store.list()?)
    }

    /// Re-register the ids of every open pending record, e.g. after a restart
    /// with a persistent store. Returns how many records were registered.
    pub fn restore_correlations(&self) -> Result<usize, OrchestrationError> {
        let mut restored = 0;
        for record in self.store.list()? {
            if record.is_closed() || (record.work_id.is_none() && record.conversation_id.is_none()) {
                continue;
            }
            self.registry.register(
                &record.operation_id,
                &record.agent.id,
                record.conversation_id.as_ref(),
                record.work_id.as_ref(),
            );
            restored += 1;
        }
        info!(restored, "correlations restored from pending store");
        Ok(restored)
    }

    /// Run a paginated task page by page and gather `items_field` from each
    /// result. Arguments gain `{"pagination": {"cursor", "max_results"}}`.
    pub async fn collect_pages(
        &self,
        agent: &AgentConfig,
        task: &str,
        args: Value,
        items_field: &str,
        pagination: PaginationOptions,
        options: RunOptions,
    ) -> Result<Vec<Value>, TaskError> {
        let base = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(TaskError::new(
                    codes::INVALID_REQUEST,
                    format!("paginated task arguments must be an object, got {other}"),
                    Recovery::Correctable,
                ))
            }
        };

        let fetch = |req: PageRequest| {
            let mut page_args = base.clone();
            let mut cursor = Map::new();
            if let Some(c) = req.cursor {
                let _ = cursor.insert("cursor".into(), Value::String(c));
            }
            if let Some(size) = req.page_size {
                let _ = cursor.insert("max_results".into(), Value::from(size));
            }
            let _ = page_args.insert("pagination".into(), Value::Object(cursor));
            let request = TaskRequest::new(task, Value::Object(page_args));
            let options = options.clone();
            async move {
                let outcome = self.run(agent, request, options).await;
                match outcome.status {
                    OutcomeStatus::Completed => Ok(outcome.data.unwrap_or(Value::Null)),
                    OutcomeStatus::Failed => Err(outcome.error.unwrap_or_else(|| {
                        TaskError::new(codes::TASK_FAILED, "page request failed", Recovery::Correctable)
                    })),
                    OutcomeStatus::Pending => Err(TaskError::new(
                        codes::PROTOCOL_VIOLATION,
                        "agent deferred a page request",
                        Recovery::Terminal,
                    )),
                }
            }
        };

        collect_all(fetch, |data: Value| page_from_value(&data, items_field), pagination).await
    }

    fn turn_lock(&self, key: &CorrelationKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.turn_locks.entry(key.clone()).or_default().value())
    }

    /// Drop the pair's lock unless another caller is waiting on it. The
    /// current holder accounts for one reference and the map for another.
    fn forget_lock(&self, key: &CorrelationKey) {
        let _ = self
            .turn_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) <= 2);
    }

    fn emit(&self, event: TaskEvent) {
        observer::notify(self.observer.as_ref(), &event);
    }

    fn correlate(&self, n: &Notification) -> Result<CorrelationKey, OrchestrationError> {
        let found = n
            .work_id
            .as_ref()
            .and_then(|w| self.registry.lookup_by_work(w))
            .or_else(|| {
                n.conversation_id
                    .as_ref()
                    .and_then(|c| self.registry.lookup_by_conversation(c))
            });

        match found {
            Some(found) => {
                let op_differs = n.operation_id.as_ref().is_some_and(|o| *o != found.operation_id);
                let agent_differs = n.agent_id.as_ref().is_some_and(|a| *a != found.agent_id);
                if op_differs || agent_differs {
                    return Err(OrchestrationError::CorrelationMismatch(format!(
                        "notification ids belong to {found}"
                    )));
                }
                Ok(found)
            }
            None => match (&n.operation_id, &n.agent_id) {
                (Some(op), Some(agent)) => Ok(CorrelationKey::new(op.clone(), agent.clone())),
                _ => Err(OrchestrationError::UnknownCorrelation),
            },
        }
    }

    /// Feed a response that arrived outside `send_turn` (notification or
    /// poll) through the normal interpretation path.
    async fn continue_with(&self, mut state: RunState, response: AgentResponse, options: &RunOptions) -> AgentOutcome {
        let result = match self.absorb(&mut state, &response) {
            Ok(()) => match self.interpret(&mut state, response, options).await {
                Ok(next) => self.drive(&mut state, next, options).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.finish(state, result)
    }

    async fn drive(&self, state: &mut RunState, mut next: Next, options: &RunOptions) -> Result<Halt, OrchestrationError> {
        loop {
            match next {
                Next::Send(turn) => {
                    let response = self.send_turn(state, turn, options).await?;
                    next = self.interpret(state, response, options).await?;
                }
                Next::Halt(halt) => return Ok(halt),
            }
        }
    }

    async fn send_turn(
        &self,
        state: &mut RunState,
        turn: TurnRequest,
        options: &RunOptions,
    ) -> Result<AgentResponse, OrchestrationError> {
        if options.cancel.is_cancelled() {
            return Err(OrchestrationError::Canceled);
        }

        state.turns += 1;
        self.emit(TaskEvent::TurnSent {
            key: state.key.clone(),
            turn: state.turns,
            has_input: turn.input.is_some(),
        });
        state.last_request = turn;

        let timeout = options.turn_timeout.unwrap_or(self.config.turn_timeout);
        let sent = Instant::now();
        let response = tokio::select! {
            biased;
            () = options.cancel.cancelled() => return Err(OrchestrationError::Canceled),
            result = tokio::time::timeout(timeout, self.transport.call(&state.agent, &state.last_request)) => {
                match result {
                    Ok(response) => response?,
                    Err(_) => return Err(OrchestrationError::Timeout(timeout)),
                }
            }
        };

        self.emit(TaskEvent::ResponseReceived {
            key: state.key.clone(),
            status: response.status,
            elapsed: sent.elapsed(),
        });
        self.absorb(state, &response)?;
        Ok(response)
    }

    /// Record disclosed ids and apply the reported state.
    fn absorb(&self, state: &mut RunState, response: &AgentResponse) -> Result<(), OrchestrationError> {
        if let Some(conv) = &response.conversation_id {
            state.conversation_id = Some(conv.clone());
        }
        if let Some(work) = &response.work_id {
            state.work_id = Some(work.clone());
        }
        self.registry.register(
            &state.key.operation_id,
            &state.key.agent_id,
            response.conversation_id.as_ref(),
            response.work_id.as_ref(),
        );

        for transition in state.lifecycle.observe(response.status)? {
            self.emit(TaskEvent::StateChanged {
                key: state.key.clone(),
                transition,
            });
        }
        Ok(())
    }

    async fn interpret(
        &self,
        state: &mut RunState,
        response: AgentResponse,
        options: &RunOptions,
    ) -> Result<Next, OrchestrationError> {
        match response.status {
            TaskState::Completed => {
                let data = match response.body {
                    ResponseBody::Data(v) => v,
                    _ => Value::Null,
                };
                Ok(Next::Halt(Halt::Completed(data)))
            }
            TaskState::Failed => {
                let error = response.error().map_or_else(
                    || TaskError::new(codes::TASK_FAILED, "agent reported failure", Recovery::Correctable),
                    |e| e.to_task_error(),
                );
                Err(OrchestrationError::AgentFailed(error))
            }
            TaskState::Rejected => {
                let reason = response
                    .error()
                    .map_or_else(|| "no reason given".to_string(), |e| e.message.clone());
                Err(OrchestrationError::AgentRejected(reason))
            }
            TaskState::Canceled => Err(OrchestrationError::Canceled),
            TaskState::InputRequired => {
                let question = match response.body {
                    ResponseBody::Question(q) => q,
                    _ => InputRequest::new("input required"),
                };
                self.clarify(state, question, options).await
            }
            TaskState::Submitted | TaskState::Working => {
                if state.work_id.is_some() || state.conversation_id.is_some() {
                    Ok(Next::Halt(Halt::Suspended))
                } else {
                    Err(OrchestrationError::ProtocolViolation(format!(
                        "agent reported {} without a work or conversation id",
                        response.status
                    )))
                }
            }
        }
    }

    async fn clarify(
        &self,
        state: &mut RunState,
        request: InputRequest,
        options: &RunOptions,
    ) -> Result<Next, OrchestrationError> {
        if state.rounds >= state.max_rounds {
            return Err(OrchestrationError::ClarificationLimit { max: state.max_rounds });
        }
        let resolver = options
            .resolver
            .as_ref()
            .or(self.resolver.as_ref())
            .ok_or(OrchestrationError::NoInputHandler)?;

        let ctx = InputContext {
            agent_id: state.key.agent_id.clone(),
            operation_id: state.key.operation_id.clone(),
            task: state.task.clone(),
            args: state.args.clone(),
            request,
            round: state.rounds + 1,
        };
        let decision = tokio::select! {
            biased;
            () = options.cancel.cancelled() => return Err(OrchestrationError::Canceled),
            decision = resolver.resolve(&ctx) => decision,
        };

        match decision {
            InputDecision::Answer(value) => {
                state.rounds += 1;
                let transition = state.lifecycle.answer_sent()?;
                self.emit(TaskEvent::StateChanged {
                    key: state.key.clone(),
                    transition,
                });
                self.emit(TaskEvent::ClarificationAnswered {
                    key: state.key.clone(),
                    round: state.rounds,
                    question: ctx.request.question,
                });
                Ok(Next::Send(state.last_request.answer(
                    state.conversation_id.clone(),
                    state.work_id.clone(),
                    value,
                )))
            }
            InputDecision::Defer => Err(OrchestrationError::InputDeferred),
            InputDecision::Reject(reason) => Err(OrchestrationError::InputRejected(reason)),
        }
    }

    fn finish(&self, mut state: RunState, result: Result<Halt, OrchestrationError>) -> AgentOutcome {
        let outcome = match result {
            Ok(Halt::Completed(data)) => AgentOutcome::completed(data, state.metadata()),
            Ok(Halt::Suspended) => match self.store.save(&state.record(None)) {
                Ok(()) => {
                    self.emit(TaskEvent::Suspended {
                        key: state.key.clone(),
                        work_id: state.work_id.clone(),
                        conversation_id: state.conversation_id.clone(),
                    });
                    AgentOutcome::pending(state.metadata())
                }
                Err(e) => {
                    let _ = state.lifecycle.fail();
                    AgentOutcome::failed(OrchestrationError::from(e).to_task_error(), state.metadata())
                }
            },
            Err(err) => {
                let _ = if matches!(err, OrchestrationError::Canceled) {
                    state.lifecycle.cancel()
                } else {
                    state.lifecycle.fail()
                };
                let error = err.to_task_error();
                warn!(
                    operation_id = %state.key.operation_id,
                    agent_id = %state.key.agent_id,
                    code = %error.code,
                    recovery = %error.recovery,
                    error = %error.message,
                    "task failed"
                );
                AgentOutcome::failed(error, state.metadata())
            }
        };

        if !outcome.is_pending() {
            self.release(&state, &outcome);
        }
        self.emit(TaskEvent::Finished {
            key: state.key.clone(),
            status: outcome.status,
            error_code: outcome.error.as_ref().map(|e| e.code.clone()),
            duration: state.clock.elapsed(),
        });
        outcome
    }

    /// Apply the cleanup policy to a task that just reached a terminal outcome.
    fn release(&self, state: &RunState, outcome: &AgentOutcome) {
        let key = &state.key;
        match self.config.cleanup {
            CleanupPolicy::OnTerminal => {
                let _ = self.registry.remove(&key.operation_id, &key.agent_id);
                if let Err(e) = self.store.remove(key) {
                    warn!(operation_id = %key.operation_id, agent_id = %key.agent_id, error = %e, "failed to drop pending record");
                }
                self.forget_lock(key);
            }
            CleanupPolicy::Manual => {
                if let Err(e) = self.store.save(&state.record(Some(outcome.clone()))) {
                    warn!(operation_id = %key.operation_id, agent_id = %key.agent_id, error = %e, "failed to record final outcome");
                }
            }
        }
    }
}
