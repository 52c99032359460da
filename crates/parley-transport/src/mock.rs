//! Scripted transport for tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use parley_core::{
    AgentConfig, AgentError, AgentId, AgentResponse, AgentTransport, InputRequest,
    TransportError, TurnRequest, WorkId,
};

/// One pre-programmed reaction to a call.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Return this response.
    Respond(AgentResponse),
    /// Fail with this transport error.
    Fail(TransportError),
    /// Wait, then play the inner turn.
    Delay(Duration, Box<ScriptedTurn>),
    /// Panic inside the transport call.
    Panic(String),
}

impl ScriptedTurn {
    /// Complete with data.
    pub fn respond_data(data: Value) -> Self {
        Self::Respond(AgentResponse::completed(data))
    }

    /// Ask a question.
    pub fn ask(question: &str) -> Self {
        Self::Respond(AgentResponse::input_required(InputRequest::new(question)))
    }

    /// Report task failure.
    pub fn fail_task(code: &str, message: &str) -> Self {
        Self::Respond(AgentResponse::failed(AgentError::new(code, message)))
    }

    /// Play `inner` after `delay`.
    pub fn delayed(delay: Duration, inner: ScriptedTurn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Deterministic transport: per-agent FIFO scripts, every request recorded.
#[derive(Default)]
pub struct ScriptedTransport {
    turns: Mutex<HashMap<AgentId, VecDeque<ScriptedTurn>>>,
    polls: Mutex<HashMap<AgentId, VecDeque<ScriptedTurn>>>,
    requests: Mutex<Vec<(AgentId, TurnRequest)>>,
}

impl ScriptedTransport {
    /// Transport with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append turns to an agent's call script.
    pub fn script(&self, agent: impl Into<AgentId>, turns: Vec<ScriptedTurn>) {
        self.turns.lock().entry(agent.into()).or_default().extend(turns);
    }

    /// Append turns to an agent's `task_status` script.
    pub fn script_status(&self, agent: impl Into<AgentId>, turns: Vec<ScriptedTurn>) {
        self.polls.lock().entry(agent.into()).or_default().extend(turns);
    }

    /// Every call so far, in order.
    pub fn requests(&self) -> Vec<(AgentId, TurnRequest)> {
        self.requests.lock().clone()
    }

    /// Calls made to one agent.
    pub fn requests_for(&self, agent: &str) -> Vec<TurnRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() == agent)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Number of calls made to one agent.
    pub fn calls_for(&self, agent: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() == agent)
            .count()
    }

    /// Unplayed call turns for an agent.
    pub fn remaining(&self, agent: &str) -> usize {
        self.turns
            .lock()
            .get(&AgentId::from_raw(agent))
            .map_or(0, VecDeque::len)
    }

    fn next(
        queues: &Mutex<HashMap<AgentId, VecDeque<ScriptedTurn>>>,
        agent: &AgentId,
    ) -> Result<ScriptedTurn, TransportError> {
        queues
            .lock()
            .get_mut(agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| TransportError::InvalidResponse(format!("no scripted turn left for {agent}")))
    }
}

async fn play(turn: ScriptedTurn) -> Result<AgentResponse, TransportError> {
    let mut current = turn;
    loop {
        match current {
            ScriptedTurn::Respond(resp) => return Ok(resp),
            ScriptedTurn::Fail(err) => return Err(err),
            ScriptedTurn::Delay(delay, inner) => {
                tokio::time::sleep(delay).await;
                current = *inner;
            }
            ScriptedTurn::Panic(msg) => panic!("{msg}"),
        }
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn call(
        &self,
        agent: &AgentConfig,
        request: &TurnRequest,
    ) -> Result<AgentResponse, TransportError> {
        self.requests.lock().push((agent.id.clone(), request.clone()));
        let turn = Self::next(&self.turns, &agent.id)?;
        play(turn).await
    }

    async fn task_status(
        &self,
        agent: &AgentConfig,
        _work_id: &WorkId,
    ) -> Result<AgentResponse, TransportError> {
        let turn = Self::next(&self.polls, &agent.id)?;
        play(turn).await
    }
}
