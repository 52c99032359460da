//! Multi-agent fan-out.
//!
//! Every agent in the input list produces exactly one result, at the same
//! index, whatever the others do. Errors and panics are caught per agent.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{stream, FutureExt, StreamExt};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use parley_core::{
    AgentConfig, AgentOutcome, OrchestrationError, OutcomeMetadata, Settled, TaskError, TaskState,
};

use crate::executor::{RunOptions, TaskExecutor, TaskRequest};
use crate::observer::panic_message;

/// One agent's raw result plus timing.
struct Attempt<R> {
    timing: Timing,
    /// `Err` carries the panic message.
    result: Result<R, String>,
}

#[derive(Clone, Copy)]
struct Timing {
    started_at: DateTime<Utc>,
    elapsed: Duration,
}

impl Timing {
    fn metadata(self, agent: &AgentConfig, final_state: TaskState) -> OutcomeMetadata {
        let mut meta = OutcomeMetadata::new(agent);
        meta.started_at = self.started_at;
        meta.response_time_ms = u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX);
        meta.final_state = Some(final_state);
        meta
    }
}

/// Runs one task against many agents and returns one outcome per agent.
pub struct Orchestrator {
    executor: Arc<TaskExecutor>,
    max_concurrency: Option<usize>,
}

impl Orchestrator {
    /// Unbounded fan-out: every agent runs at once.
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            executor,
            max_concurrency: None,
        }
    }

    /// At most `limit` agents in flight; results keep input order.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Executor each agent run goes through.
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Run `op` against every agent and shape each result into an outcome.
    pub async fn dispatch<T, E, F, Fut>(
        &self,
        agents: &[AgentConfig],
        op: F,
    ) -> Result<Vec<AgentOutcome<T>>, OrchestrationError>
    where
        F: Fn(AgentConfig) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<TaskError>,
    {
        if agents.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }
        let attempts = self.fan_out(agents, op).await;

        Ok(agents
            .iter()
            .zip(attempts)
            .map(|(agent, Attempt { timing, result })| match result {
                Ok(Ok(value)) => AgentOutcome::completed(value, timing.metadata(agent, TaskState::Completed)),
                Ok(Err(e)) => AgentOutcome::failed(e.into(), timing.metadata(agent, TaskState::Failed)),
                Err(panic) => AgentOutcome::failed(
                    OrchestrationError::Panicked(panic).to_task_error(),
                    timing.metadata(agent, TaskState::Failed),
                ),
            })
            .collect())
    }

    /// Like [`dispatch`](Self::dispatch) but returns raw settle results.
    pub async fn execute_raw<T, E, F, Fut>(
        &self,
        agents: &[AgentConfig],
        op: F,
    ) -> Result<Vec<Settled<T>>, OrchestrationError>
    where
        F: Fn(AgentConfig) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<TaskError>,
    {
        if agents.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }
        let attempts = self.fan_out(agents, op).await;

        Ok(agents
            .iter()
            .zip(attempts)
            .map(|(agent, attempt)| {
                let agent_id = agent.id.clone();
                match attempt.result {
                    Ok(Ok(value)) => Settled::Fulfilled { agent_id, value },
                    Ok(Err(e)) => Settled::Rejected {
                        agent_id,
                        reason: e.into(),
                    },
                    Err(panic) => Settled::Rejected {
                        agent_id,
                        reason: OrchestrationError::Panicked(panic).to_task_error(),
                    },
                }
            })
            .collect())
    }

    /// Run one task against every agent under a single shared operation id.
    #[instrument(skip_all, fields(task = %request.task, agents = agents.len()))]
    pub async fn run_task(
        &self,
        agents: &[AgentConfig],
        request: TaskRequest,
        options: RunOptions,
    ) -> Result<Vec<AgentOutcome>, OrchestrationError> {
        if agents.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }
        let operation_id = request.operation_id.clone().unwrap_or_default();
        let request = request.with_operation_id(operation_id.clone());
        info!(operation_id = %operation_id, "dispatching task to agents");

        let executor = &self.executor;
        let attempts = self
            .fan_out(agents, |agent| {
                let request = request.clone();
                let options = options.clone();
                async move { executor.run(&agent, request, options).await }
            })
            .await;

        Ok(agents
            .iter()
            .zip(attempts)
            .map(|(agent, Attempt { timing, result })| match result {
                Ok(outcome) => outcome,
                Err(panic) => {
                    warn!(agent_id = %agent.id, panic = %panic, "agent run panicked");
                    let mut meta = timing.metadata(agent, TaskState::Failed);
                    meta.operation_id = Some(operation_id.clone());
                    meta.task = Some(request.task.clone());
                    AgentOutcome::failed(OrchestrationError::Panicked(panic).to_task_error(), meta)
                }
            })
            .collect())
    }

    async fn fan_out<R, F, Fut>(&self, agents: &[AgentConfig], op: F) -> Vec<Attempt<R>>
    where
        F: Fn(AgentConfig) -> Fut,
        Fut: Future<Output = R>,
    {
        let op = &op;
        let calls = agents.iter().cloned().map(|agent| async move {
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = AssertUnwindSafe(async move { op(agent).await })
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(&*panic));
            Attempt {
                timing: Timing {
                    started_at,
                    elapsed: clock.elapsed(),
                },
                result,
            }
        });

        match self.max_concurrency {
            Some(limit) => stream::iter(calls).buffered(limit).collect().await,
            None => join_all(calls).await,
        }
    }
}
