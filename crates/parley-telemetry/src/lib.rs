//! # parley-telemetry
//!
//! Process-wide observability setup: a `tracing` subscriber driven by
//! [`TelemetryConfig`], and the Prometheus recorder that backs the
//! server's `/metrics` endpoint.

#![deny(unsafe_code)]

use std::str::FromStr;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Failures installing logging or metrics.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level name is not a `tracing` level.
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    /// A global subscriber is already set or the filter is invalid.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
    /// A global metrics recorder is already set.
    #[error("failed to install metrics recorder: {0}")]
    Recorder(String),
}

/// Logging configuration.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. `RUST_LOG` overrides it when set.
    pub log_level: Level,
    /// Per-module levels, e.g. `("parley_transport", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from a level name such as `"debug"`.
    pub fn from_level(level: &str, json: bool) -> Result<Self, TelemetryError> {
        let log_level = Level::from_str(level).map_err(|_| TelemetryError::InvalidLevel(level.to_string()))?;
        Ok(Self {
            log_level,
            module_levels: Vec::new(),
            json,
        })
    }

    /// Override the level for one module path.
    #[must_use]
    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }

    /// The `EnvFilter` directive string this config stands for.
    pub fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        directives
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Install the global Prometheus recorder and return the handle that
/// renders it.
pub fn install_prometheus() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally. Used when
/// metrics are off and in tests.
pub fn detached_prometheus() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}
