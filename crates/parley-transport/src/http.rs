//! JSON-RPC over HTTP transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use tracing::{debug, instrument};

use parley_core::{AgentConfig, AgentResponse, AgentTransport, TransportError, TurnRequest, WorkId};

use crate::wire::{self, RpcRequest, RpcResponse};

const USER_AGENT: &str = concat!("parley/", env!("CARGO_PKG_VERSION"));

/// HTTP client timeouts.
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// TCP and TLS connect deadline.
    pub connect_timeout: Duration,
    /// Upper bound for one HTTP exchange. The executor's per-turn timeout
    /// normally fires first.
    pub request_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// JSON-RPC 2.0 over HTTP POST. One shared connection pool for every agent.
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// Build the shared client.
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Client with default timeouts.
    pub fn with_defaults() -> Result<Self, TransportError> {
        Self::new(HttpTransportConfig::default())
    }

    async fn post(&self, agent: &AgentConfig, body: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let mut req = self
            .client
            .post(&agent.agent_uri)
            .header("accept", "application/json")
            .json(body);
        if let Some(token) = &agent.auth_token {
            req = req.bearer_auth(token);
        }
        for (name, value) in &agent.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req.send().await.map_err(|e| self.classify(&e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(match TransportError::from_status(status.as_u16(), text) {
                TransportError::RateLimited { .. } => TransportError::RateLimited { retry_after },
                other => other,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(&e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::InvalidResponse(format!("malformed JSON-RPC body: {e}")))
    }

    fn classify(&self, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.config.request_timeout)
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(agent_id = %agent.id, operation = %request.operation))]
    async fn call(
        &self,
        agent: &AgentConfig,
        request: &TurnRequest,
    ) -> Result<AgentResponse, TransportError> {
        let body = wire::build_send(agent, request);
        debug!(rpc_id = %body.id, method = body.method, "sending turn");
        let response = self.post(agent, &body).await?;
        wire::decode(agent.protocol, response)
    }

    #[instrument(skip_all, fields(agent_id = %agent.id, work_id = %work_id))]
    async fn task_status(
        &self,
        agent: &AgentConfig,
        work_id: &WorkId,
    ) -> Result<AgentResponse, TransportError> {
        let body = wire::build_task_get(agent, work_id).ok_or_else(|| {
            TransportError::Unsupported(format!("{:?} agents have no status poll", agent.protocol))
        })?;
        let response = self.post(agent, &body).await?;
        wire::decode(agent.protocol, response)
    }
}
