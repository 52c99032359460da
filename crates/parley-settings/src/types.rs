//! Settings type definitions.
//!
//! Every section is `camelCase` JSON with `#[serde(default)]`, so a
//! settings file only needs the keys it changes.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use parley_core::AgentConfig;
use parley_engine::{CleanupPolicy, ExecutorConfig, ResolverSpec};
use parley_transport::RetryConfig;
use parley_webhook::{CallbackUrlTemplate, NotificationVerifier};

use crate::errors::{Result, SettingsError};

/// Root settings, loaded from `~/.parley/settings.json`.
///
/// ```json
/// {
///   "webhook": { "secret": "s3cret", "urlTemplate": "https://me.example/webhooks/{task_type}/{agent_id}/{operation_id}" },
///   "store": { "kind": "sqlite", "path": "~/.parley/pending.db" },
///   "agents": [{ "id": "acme", "agentUri": "https://acme.example/a2a" }]
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Run defaults.
    pub executor: ExecutorSettings,
    /// Callback URL and signature checking.
    pub webhook: WebhookSettings,
    /// Notification receiver address.
    pub server: ServerSettings,
    /// Where suspended runs are kept.
    pub store: StoreSettings,
    /// Transport retry and circuit breaker.
    pub retry: RetrySettings,
    /// Log level and format.
    pub logging: LoggingSettings,
    /// Answers clarification questions when a run supplies no resolver.
    pub resolver: ResolverSpec,
    /// Agents a dispatch may target.
    pub agents: Vec<AgentConfig>,
}

impl ParleySettings {
    /// Executor configuration, with the callback URL template parsed.
    pub fn executor_config(&self) -> Result<ExecutorConfig> {
        if self.executor.max_clarification_rounds == 0 {
            return Err(SettingsError::invalid(
                "executor.maxClarificationRounds",
                "must be at least 1",
            ));
        }
        let callback_url = self
            .webhook
            .url_template
            .as_deref()
            .map(CallbackUrlTemplate::parse)
            .transpose()
            .map_err(|e| SettingsError::invalid("webhook.urlTemplate", e.to_string()))?;

        Ok(ExecutorConfig {
            turn_timeout: Duration::from_millis(self.executor.turn_timeout_ms),
            max_clarification_rounds: self.executor.max_clarification_rounds,
            cleanup: self.executor.cleanup,
            callback_url,
        })
    }

    /// Transport retry configuration.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            circuit_breaker_threshold: self.retry.circuit_breaker_threshold,
            circuit_breaker_cooldown: Duration::from_millis(self.retry.circuit_breaker_cooldown_ms),
            ..RetryConfig::default()
        }
    }

    /// Verifier for inbound notifications. Without a secret it rejects
    /// everything.
    pub fn verifier(&self) -> NotificationVerifier {
        NotificationVerifier::from_optional(self.webhook.secret.as_deref())
            .with_tolerance(Duration::from_secs(self.webhook.tolerance_secs))
    }

    /// Configured agents, filtered to `ids` when any are given.
    pub fn agents_named(&self, ids: &[String]) -> Result<Vec<AgentConfig>> {
        if ids.is_empty() {
            return Ok(self.agents.clone());
        }
        ids.iter()
            .map(|id| {
                self.agents
                    .iter()
                    .find(|a| a.id.as_str() == id)
                    .cloned()
                    .ok_or_else(|| SettingsError::invalid("agents", format!("no agent with id {id}")))
            })
            .collect()
    }
}

/// Executor defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorSettings {
    /// Deadline for one agent turn.
    pub turn_timeout_ms: u64,
    /// Questions answered per run; at least 1.
    pub max_clarification_rounds: u32,
    /// When finished runs are forgotten.
    pub cleanup: CleanupPolicy,
    /// `None` runs every agent at once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_agents: Option<usize>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            turn_timeout_ms: 30_000,
            max_clarification_rounds: 3,
            cleanup: CleanupPolicy::OnTerminal,
            max_concurrent_agents: None,
        }
    }
}

/// Notification callback and verification settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSettings {
    /// Callback URL handed to agents; placeholders `{task_type}`,
    /// `{agent_id}`, `{operation_id}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_template: Option<String>,
    /// Shared HMAC secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Maximum clock skew for a notification timestamp.
    pub tolerance_secs: u64,
    /// Header carrying `sha256=<hex>`.
    pub signature_header: String,
    /// Header carrying the signing timestamp.
    pub timestamp_header: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url_template: None,
            secret: None,
            tolerance_secs: 300,
            signature_header: "x-parley-signature".to_string(),
            timestamp_header: "x-parley-timestamp".to_string(),
        }
    }
}

impl fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("url_template", &self.url_template)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("tolerance_secs", &self.tolerance_secs)
            .field("signature_header", &self.signature_header)
            .field("timestamp_header", &self.timestamp_header)
            .finish()
    }
}

/// Listen address for the receiver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl ServerSettings {
    /// `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where suspended operations are kept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoreSettings {
    /// Lost on restart.
    #[default]
    Memory,
    /// SQLite file; survives restarts.
    Sqlite {
        /// A leading `~/` expands to the home directory.
        path: String,
    },
}

impl StoreSettings {
    /// The SQLite file, with `~/` expanded. `None` for the memory store.
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        match self {
            Self::Memory => None,
            Self::Sqlite { path } => Some(expand_home(path)),
        }
    }
}

/// Transport retry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    /// Consecutive transient failures that open an agent's breaker.
    pub circuit_breaker_threshold: u32,
    /// How long a breaker stays open.
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` level; `RUST_LOG` wins when set.
    pub level: String,
    /// One JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

pub(crate) fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => crate::loader::home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let settings = ParleySettings::default();
        assert_eq!(settings.executor.turn_timeout_ms, 30_000);
        assert_eq!(settings.executor.max_clarification_rounds, 3);
        assert_eq!(settings.executor.cleanup, CleanupPolicy::OnTerminal);
        assert_eq!(settings.webhook.tolerance_secs, 300);
        assert_eq!(settings.webhook.signature_header, "x-parley-signature");
        assert_eq!(settings.server.bind_addr(), "127.0.0.1:8787");
        assert_eq!(settings.store, StoreSettings::Memory);
        assert_eq!(settings.resolver, ResolverSpec::Defer);
        assert!(settings.agents.is_empty());
    }

    #[test]
    fn camel_case_round_trip() {
        let value = serde_json::to_value(ParleySettings::default()).unwrap();
        assert_eq!(value["executor"]["turnTimeoutMs"], 30_000);
        assert_eq!(value["executor"]["cleanup"], "onTerminal");
        assert_eq!(value["retry"]["circuitBreakerCooldownMs"], 30_000);
        assert_eq!(value["store"]["kind"], "memory");
        assert!(value["webhook"].get("secret").is_none());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let settings: ParleySettings = serde_json::from_value(json!({
            "executor": {"maxClarificationRounds": 5},
            "store": {"kind": "sqlite", "path": "/var/lib/parley/pending.db"},
            "agents": [{"id": "acme", "agentUri": "https://acme.example/a2a"}]
        }))
        .unwrap();
        assert_eq!(settings.executor.max_clarification_rounds, 5);
        assert_eq!(settings.executor.turn_timeout_ms, 30_000);
        assert_eq!(
            settings.store.sqlite_path(),
            Some(PathBuf::from("/var/lib/parley/pending.db"))
        );
        assert_eq!(settings.agents[0].id.as_str(), "acme");
    }

    #[test]
    fn executor_config_parses_template() {
        let mut settings = ParleySettings::default();
        settings.webhook.url_template = Some("https://me.example/hooks/{task_type}/{agent_id}/{operation_id}".into());
        settings.executor.turn_timeout_ms = 1_500;
        let config = settings.executor_config().unwrap();
        assert_eq!(config.turn_timeout, Duration::from_millis(1_500));
        assert!(config.callback_url.is_some());

        settings.webhook.url_template = Some("https://me.example/{nope}".into());
        let err = settings.executor_config().unwrap_err();
        assert!(err.to_string().contains("webhook.urlTemplate"));
    }

    #[test]
    fn zero_clarification_rounds_rejected() {
        let mut settings = ParleySettings::default();
        settings.executor.max_clarification_rounds = 0;
        assert!(settings.executor_config().is_err());
    }

    #[test]
    fn verifier_and_retry_follow_settings() {
        let mut settings = ParleySettings::default();
        assert!(!settings.verifier().is_configured());
        settings.webhook.secret = Some("s3cret".into());
        settings.webhook.tolerance_secs = 60;
        let verifier = settings.verifier();
        assert!(verifier.is_configured());
        assert_eq!(verifier.tolerance(), Duration::from_secs(60));

        settings.retry.max_retries = 7;
        assert_eq!(settings.retry_config().max_retries, 7);
        assert_eq!(settings.retry_config().base_delay, Duration::from_millis(250));
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let mut settings = WebhookSettings::default();
        settings.secret = Some("hunter2".into());
        let debug = format!("{settings:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn agents_named_selects_and_reports_missing() {
        let settings: ParleySettings = serde_json::from_value(json!({
            "agents": [
                {"id": "a", "agentUri": "https://a.example"},
                {"id": "b", "agentUri": "https://b.example"}
            ]
        }))
        .unwrap();
        assert_eq!(settings.agents_named(&[]).unwrap().len(), 2);
        let picked = settings.agents_named(&["b".into()]).unwrap();
        assert_eq!(picked[0].id.as_str(), "b");
        assert!(settings.agents_named(&["c".into()]).is_err());
    }
}
