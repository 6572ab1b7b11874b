use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corral_backends::{backend_from_settings, LocalBackend};
use corral_core::backend::{BackendKind, ExecutionBackend};
use corral_core::session::SessionMode;
use corral_engine::{ChannelBroadcaster, Collaborators, Orchestrator, StartOptions};
use corral_settings::{init_settings, load_settings, CorralSettings};
use corral_telemetry::{init_telemetry, LogQuery, SqliteLogSink, TelemetryConfig};
use corral_worker::WorkerConfig;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "corral", version, about = "Run coding-agent sessions locally, in containers or in cloud apps")]
struct Cli {
    /// Override the configured log level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the worker HTTP surface over the local backend.
    Worker {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Directory relative file reads resolve against.
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Start a session, send one prompt and print session events as JSON lines.
    Run {
        #[arg(long)]
        backend: Option<BackendKind>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long, default_value = "build")]
        mode: SessionMode,
        #[arg(long)]
        model: Option<String>,
        prompt: String,
    },
    /// Remove containers or apps no session tracks.
    Cleanup {
        #[arg(long)]
        backend: Option<BackendKind>,
    },
    /// Print the execution unit state for a workspace.
    Status {
        #[arg(long)]
        backend: Option<BackendKind>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Print persisted warnings and errors as JSON lines, newest first.
    Logs {
        #[arg(long)]
        session: Option<String>,
        /// Container or app name.
        #[arg(long)]
        unit: Option<String>,
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Only errors.
        #[arg(long)]
        errors: bool,
        /// RFC 3339 lower bound.
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings().context("failed to load settings")?;
    if let Some(level) = cli.log_level {
        settings.telemetry.level = level;
    }
    let _telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.telemetry));
    if init_settings(settings.clone()).is_err() {
        tracing::debug!("settings already initialized");
    }

    match cli.command {
        Command::Worker { host, port, root } => serve_worker(&settings, host, port, root).await,
        Command::Run { backend, dir, mode, model, prompt } => {
            run_once(with_backend(settings, backend), &dir, mode, model, prompt).await
        }
        Command::Cleanup { backend } => {
            let backend = backend_from_settings(&with_backend(settings, backend))?;
            let removed = backend.cleanup_orphans().await?;
            println!("{}", serde_json::json!({ "removed": removed }));
            Ok(())
        }
        Command::Status { backend, dir } => {
            let backend = backend_from_settings(&with_backend(settings, backend))?;
            let state = backend.container_state(&workspace(&dir)?).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::Logs { session, unit, backend, errors, since, limit } => {
            let query = LogQuery {
                session_id: session,
                backend: backend.map(|b| b.to_string()),
                unit,
                errors_only: errors,
                since,
                limit: Some(limit),
            };
            print_logs(&settings, &query)
        }
    }
}

fn print_logs(settings: &CorralSettings, query: &LogQuery) -> Result<()> {
    let path = TelemetryConfig::from_settings(&settings.telemetry).log_db_path;
    let sink = SqliteLogSink::new(&path).with_context(|| format!("failed to open log database {}", path.display()))?;
    for record in sink.query(query).context("failed to query logs")? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn with_backend(mut settings: CorralSettings, kind: Option<BackendKind>) -> CorralSettings {
    if let Some(kind) = kind {
        settings.backend.kind = kind;
    }
    settings
}

fn workspace(dir: &Path) -> Result<String> {
    let path = std::fs::canonicalize(dir).with_context(|| format!("workspace {} not found", dir.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

async fn serve_worker(
    settings: &CorralSettings,
    host: Option<String>,
    port: Option<u16>,
    root: Option<PathBuf>,
) -> Result<()> {
    let mut config = WorkerConfig::from_settings(&settings.worker);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(root) = root {
        config.root = root;
    }
    let backend: Arc<dyn ExecutionBackend> = Arc::new(LocalBackend::from_settings(&settings.local));
    let handle = corral_worker::start(config, backend).await.context("failed to bind worker")?;

    tokio::select! {
        _ = handle.wait() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("worker shutting down"),
    }
    Ok(())
}

async fn run_once(
    settings: CorralSettings,
    dir: &Path,
    mode: SessionMode,
    model: Option<String>,
    prompt: String,
) -> Result<()> {
    let backend = backend_from_settings(&settings)?;
    let sink = Arc::new(ChannelBroadcaster::default());
    let mut events = sink.subscribe();
    let orch = Arc::new(Orchestrator::from_settings(
        backend,
        Collaborators::from_settings(&settings, sink),
        &settings,
    ));

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "failed to encode session event"),
                },
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let options = StartOptions { working_dir: workspace(dir)?, mode: Some(mode), model, ..Default::default() };
    let id = orch.start_session(options).await?.id;

    let turn = {
        let orch = orch.clone();
        let id = id.clone();
        tokio::spawn(async move { orch.send_message(&id, &prompt, mode.default_permission(), None).await })
    };
    let outcome = tokio::select! {
        joined = turn => joined.context("turn task failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            orch.interrupt_session(&id).await
        }
    };

    let finished = orch.stop_session(&id).await?;
    tracing::info!(
        session_id = %id,
        cost_usd = finished.total_cost_usd,
        duration_ms = finished.total_duration_ms,
        "session finished"
    );
    drop(orch);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        tracing::debug!("event printer still running at exit");
    }
    outcome.map_err(Into::into)
}
