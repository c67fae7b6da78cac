#![forbid(unsafe_code)]

//! `context-relay` command-line front end.
//!
//! Loads configuration, opens the checkpoint database and runs one
//! orchestration command: submitting task requests, inspecting session
//! status and continuity metrics, recovering checkpoints, purging old
//! checkpoints, and managing global objectives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use context_relay::config::GlobalConfig;
use context_relay::models::session::SessionStatus;
use context_relay::models::task::{Priority, TaskRequest};
use context_relay::orchestrator::{CheckpointStore, Relay};
use context_relay::persistence::db::{self, Database};
use context_relay::persistence::objective_repo::ObjectiveRepo;
use context_relay::persistence::session_repo::SessionRepo;
use context_relay::scheduler::{ExecutorRegistry, SysinfoProbe};
use context_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "context-relay", about = "Context-bounded multi-agent task orchestration", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit task requests from a JSON file (one request or an array).
    Submit {
        /// File holding the request(s).
        file: PathBuf,
        /// Resume this active session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
    },
    /// Show sessions and global objective progress.
    Status {
        /// Show a single session.
        #[arg(long)]
        session: Option<String>,
    },
    /// Show checkpoint, recovery and bridge counters.
    Metrics,
    /// Reconstruct a checkpoint and print its snapshot.
    Recover {
        /// Checkpoint id.
        checkpoint_id: String,
    },
    /// Purge checkpoints older than the retention window.
    Cleanup {
        /// Override the configured retention in days.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Manage global objectives.
    Objective {
        #[command(subcommand)]
        action: ObjectiveAction,
    },
}

#[derive(Debug, Subcommand)]
enum ObjectiveAction {
    /// Create a global objective.
    Add {
        /// Objective name.
        #[arg(long)]
        name: String,
        /// Priority: low, medium, high or critical.
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Completion criteria, repeatable.
        #[arg(long = "criterion")]
        criteria: Vec<String>,
    },
    /// List every global objective.
    List,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!(db_path = %config.db_path.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db_path = config.db_path.to_string_lossy().to_string();
    let db = Arc::new(db::connect(&db_path).await?);

    match args.command {
        Command::Submit { file, session } => submit(config, db, &file, session.as_deref()).await,
        Command::Status { session } => status(db, session.as_deref()).await,
        Command::Metrics => {
            let store = CheckpointStore::new(db, &config.persistence);
            print_json(&store.continuity_metrics().await?)
        }
        Command::Recover { checkpoint_id } => {
            let store = CheckpointStore::new(db, &config.persistence);
            print_json(&store.recover(&checkpoint_id).await?)
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let store = CheckpointStore::new(db, &config.persistence);
            let report = store
                .cleanup(Utc::now() - ChronoDuration::days(i64::from(days)))
                .await?;
            print_json(&serde_json::json!({
                "checkpoints": report.checkpoints,
                "recovery_events": report.recovery_events,
            }))
        }
        Command::Objective { action } => objective(db, action).await,
    }
}

async fn submit(
    config: GlobalConfig,
    db: Arc<Database>,
    file: &Path,
    session: Option<&str>,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let requests: Vec<TaskRequest> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };

    let executors = ExecutorRegistry::from_commands(&config.executors)?;
    let probe = Arc::new(SysinfoProbe::default());
    let relay = match session {
        Some(id) => Relay::resume(config, db, executors, probe, id).await?,
        None => Relay::start(config, db, executors, probe).await?,
    };
    info!(session_id = %relay.session_id().await, requests = requests.len(), "submitting");

    let mut outcomes = Vec::with_capacity(requests.len());
    let mut failure = None;
    for request in requests {
        match relay.submit_task(request).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                error!(%err, "submission aborted");
                failure = Some(err);
                break;
            }
        }
    }
    relay.shutdown().await;
    print_json(&outcomes)?;
    failure.map_or(Ok(()), Err)
}

async fn status(db: Arc<Database>, session: Option<&str>) -> Result<()> {
    let sessions = SessionRepo::new(Arc::clone(&db));
    let objectives = ObjectiveRepo::new(db).list_all().await?;
    let listed = match session {
        Some(id) => vec![sessions
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?],
        None => sessions.list_by_status(SessionStatus::Active).await?,
    };
    print_json(&serde_json::json!({
        "sessions": listed,
        "objectives": objectives,
    }))
}

async fn objective(db: Arc<Database>, action: ObjectiveAction) -> Result<()> {
    let repo = ObjectiveRepo::new(db);
    match action {
        ObjectiveAction::Add {
            name,
            priority,
            criteria,
        } => {
            let priority = Priority::parse(&priority)
                .ok_or_else(|| AppError::Config(format!("unknown priority '{priority}'")))?;
            let created = repo
                .create(&context_relay::models::objective::GlobalObjective::new(
                    &name,
                    priority,
                    HashMap::new(),
                    criteria,
                ))
                .await?;
            print_json(&created)
        }
        ObjectiveAction::List => print_json(&repo.list_all().await?),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
