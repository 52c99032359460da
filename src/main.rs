//! `parley`: run the webhook receiver, dispatch a task to configured
//! agents, or inspect suspended operations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_engine::{
    CompositeObserver, CorrelationRegistry, InMemoryPendingStore, MetricsObserver, Orchestrator,
    PaginationOptions, PendingStore, RunOptions, SqlitePendingStore, TaskExecutor, TaskObserver,
    TaskRequest, TracingObserver,
};
use parley_server::{ServerConfig, WebhookServer};
use parley_settings::ParleySettings;
use parley_telemetry::TelemetryConfig;
use parley_transport::{HttpTransport, RetryingTransport};

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Multi-agent task orchestration")]
struct Cli {
    /// Settings file. Defaults to `~/.parley/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Receive agent notifications until interrupted.
    Serve,
    /// Run one task against the configured agents and print the outcomes.
    Dispatch {
        #[arg(long)]
        task: String,
        /// Task arguments as JSON.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Restrict to these agent ids (repeatable). All agents when omitted.
        #[arg(long = "agent")]
        agents: Vec<String>,
        /// Treat the task as paginated and gather this field from every page.
        #[arg(long)]
        items_field: Option<String>,
        #[arg(long, requires = "items_field")]
        max_items: Option<usize>,
    },
    /// List suspended operations in the configured store.
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => parley_settings::load_settings_from_path(path),
        None => parley_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let telemetry = TelemetryConfig::from_level(&settings.logging.level, settings.logging.json)?;
    parley_telemetry::init_telemetry(&telemetry)?;

    match cli.command {
        Command::Serve => serve(&settings).await,
        Command::Dispatch {
            task,
            args,
            agents,
            items_field,
            max_items,
        } => dispatch(&settings, task, &args, &agents, items_field, max_items).await,
        Command::Pending => pending(&settings),
    }
}

fn pending_store(settings: &ParleySettings) -> Result<Arc<dyn PendingStore>> {
    Ok(match settings.store.sqlite_path() {
        Some(path) => Arc::new(
            SqlitePendingStore::open(&path)
                .with_context(|| format!("failed to open pending store at {}", path.display()))?,
        ),
        None => Arc::new(InMemoryPendingStore::new()),
    })
}

fn build_executor(settings: &ParleySettings) -> Result<Arc<TaskExecutor>> {
    let http = HttpTransport::with_defaults()?;
    let transport = Arc::new(RetryingTransport::new(http, settings.retry_config()));
    let observers: Vec<Arc<dyn TaskObserver>> = vec![Arc::new(TracingObserver), Arc::new(MetricsObserver)];
    let observer = CompositeObserver::new(observers);

    let executor = TaskExecutor::new(transport, Arc::new(CorrelationRegistry::new()))
        .with_config(settings.executor_config()?)
        .with_pending_store(pending_store(settings)?)
        .with_observer(Arc::new(observer))
        .with_resolver(settings.resolver.build());

    let restored = executor.restore_correlations()?;
    if restored > 0 {
        info!(restored, "resumed tracking of suspended operations");
    }
    Ok(Arc::new(executor))
}

async fn serve(settings: &ParleySettings) -> Result<()> {
    let prometheus = parley_telemetry::install_prometheus()?;
    let executor = build_executor(settings)?;

    let verifier = settings.verifier();
    if !verifier.is_configured() {
        warn!("no webhook secret configured; every notification will be rejected");
    }
    if settings.webhook.url_template.is_none() {
        warn!("no callback URL template configured; agents will not be told where to call back");
    }

    let config = ServerConfig {
        signature_header: settings.webhook.signature_header.clone(),
        timestamp_header: settings.webhook.timestamp_header.clone(),
        ..ServerConfig::default()
    };
    let server = WebhookServer::new(executor, verifier, config).with_prometheus(prometheus);

    let mut outcomes = server.subscribe();
    let _ = tokio::spawn(async move {
        while let Ok(outcome) = outcomes.recv().await {
            info!(
                agent_id = %outcome.metadata.agent_id,
                status = ?outcome.status,
                success = outcome.success,
                "task advanced by notification"
            );
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
        }
        signal.cancel();
    });

    let listener = WebhookServer::bind(&settings.server.bind_addr()).await?;
    server.serve(listener, shutdown).await?;
    Ok(())
}

async fn dispatch(
    settings: &ParleySettings,
    task: String,
    args: &str,
    agent_ids: &[String],
    items_field: Option<String>,
    max_items: Option<usize>,
) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    let agents = settings.agents_named(agent_ids)?;
    if agents.is_empty() {
        bail!("no agents configured; add some under \"agents\" in the settings file");
    }

    let executor = build_executor(settings)?;
    let mut orchestrator = Orchestrator::new(Arc::clone(&executor));
    if let Some(limit) = settings.executor.max_concurrent_agents {
        orchestrator = orchestrator.with_max_concurrency(limit);
    }

    let outcomes = match items_field {
        None => {
            orchestrator
                .run_task(&agents, TaskRequest::new(task, args), RunOptions::default())
                .await?
        }
        Some(field) => {
            let pagination = PaginationOptions {
                max_items,
                ..PaginationOptions::default()
            };
            orchestrator
                .dispatch(&agents, |agent| {
                    let executor = Arc::clone(&executor);
                    let (task, args, field, pagination) =
                        (task.clone(), args.clone(), field.clone(), pagination.clone());
                    async move {
                        executor
                            .collect_pages(&agent, &task, args, &field, pagination, RunOptions::default())
                            .await
                            .map(Value::Array)
                    }
                })
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

fn pending(settings: &ParleySettings) -> Result<()> {
    if settings.store.sqlite_path().is_none() {
        bail!("the memory store does not outlive a process; configure store.kind = \"sqlite\"");
    }
    let records = pending_store(settings)?.list()?;
    let rows: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "operationId": r.operation_id,
                "agentId": r.agent.id,
                "task": r.task,
                "state": r.state,
                "workId": r.work_id,
                "conversationId": r.conversation_id,
                "clarificationRounds": r.clarification_rounds,
                "startedAt": r.started_at,
                "updatedAt": r.updated_at,
                "closed": r.is_closed(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
