//! Retry and per-agent circuit breaking around any transport.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tracing::{info, warn};

use parley_core::{AgentConfig, AgentId, AgentResponse, AgentTransport, Recovery, TransportError, TurnRequest, WorkId};

/// Retry and circuit breaker settings for [`RetryingTransport`].
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Random spread as a fraction of the delay.
    pub jitter_factor: f64,
    /// Consecutive transient failures that open an agent's breaker.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker refuses calls.
    pub circuit_breaker_cooldown: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }
}

/// Wraps an [`AgentTransport`] with retry and a circuit breaker.
///
/// - Retries only errors whose `is_retryable()` holds; a timed-out turn is
///   never resent because the agent may already have acted on it
/// - Honours `Retry-After` hints
/// - N consecutive transient failures → open → cooldown → half-open → success → closed
///
/// Breaker state is kept per agent id, so one failing agent never trips
/// calls to another.
pub struct RetryingTransport<T: AgentTransport> {
    inner: T,
    config: RetryConfig,
    breakers: DashMap<AgentId, Breaker>,
    total_retries: AtomicU64,
}

impl<T: AgentTransport> RetryingTransport<T> {
    /// Wrap `inner` with this configuration.
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            breakers: DashMap::new(),
            total_retries: AtomicU64::new(0),
        }
    }

    /// Wrap `inner` with the default configuration.
    pub fn with_defaults(inner: T) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn check_circuit(&self, agent: &AgentId) -> Result<(), TransportError> {
        let Some(mut breaker) = self.breakers.get_mut(agent) else {
            return Ok(());
        };
        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    breaker.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(TransportError::Unavailable {
                        status: 503,
                        body: "circuit breaker open".into(),
                    })
                }
            }
        }
    }

    fn record_success(&self, agent: &AgentId) {
        let Some(mut breaker) = self.breakers.get_mut(agent) else {
            return;
        };
        breaker.consecutive_failures = 0;
        if breaker.state != CircuitState::Closed {
            info!(transport = self.inner.name(), agent_id = %agent, "circuit breaker closed after successful call");
            breaker.state = CircuitState::Closed;
        }
    }

    fn record_failure(&self, agent: &AgentId) {
        let mut breaker = self.breakers.entry(agent.clone()).or_default();
        breaker.consecutive_failures += 1;
        let failures = breaker.consecutive_failures;
        if failures >= self.config.circuit_breaker_threshold
            && matches!(breaker.state, CircuitState::Closed | CircuitState::HalfOpen)
        {
            warn!(
                transport = self.inner.name(),
                agent_id = %agent,
                failures,
                cooldown_ms = self.config.circuit_breaker_cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
            breaker.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Exponential backoff with jitter, or the server's hint when given.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let spread = capped * self.config.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(1.0) as u64)
    }

    /// Retries performed across all agents.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Breaker state for one agent; agents never seen are `"closed"`.
    pub fn circuit_state_name(&self, agent: &AgentId) -> &'static str {
        match self.breakers.get(agent).map(|b| b.state.clone()) {
            None | Some(CircuitState::Closed) => "closed",
            Some(CircuitState::Open { .. }) => "open",
            Some(CircuitState::HalfOpen) => "half_open",
        }
    }

    async fn with_retry<F, Fut>(&self, agent: &AgentId, mut attempt_once: F) -> Result<AgentResponse, TransportError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<AgentResponse, TransportError>> + Send,
    {
        self.check_circuit(agent)?;

        let mut attempt = 0;
        loop {
            match attempt_once().await {
                Ok(response) => {
                    self.record_success(agent);
                    return Ok(response);
                }
                Err(e) => {
                    if e.recovery() == Recovery::Transient {
                        self.record_failure(agent);
                    } else {
                        // The agent answered; it is healthy even if it said no.
                        self.record_success(agent);
                    }
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        transport = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    self.check_circuit(agent)?;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<T: AgentTransport> AgentTransport for RetryingTransport<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn call(
        &self,
        agent: &AgentConfig,
        request: &TurnRequest,
    ) -> Result<AgentResponse, TransportError> {
        self.with_retry(&agent.id, || self.inner.call(agent, request)).await
    }

    async fn task_status(
        &self,
        agent: &AgentConfig,
        work_id: &WorkId,
    ) -> Result<AgentResponse, TransportError> {
        self.with_retry(&agent.id, || self.inner.task_status(agent, work_id)).await
    }
}
