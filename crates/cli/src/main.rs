//! Operator CLI for the stager.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Serialize;
use stager_core::config::AppConfig;
use stager_core::{ReplicaId, ReplicaStatus, TaskId, TaskStatus};
use stager_metadata::StagingCoordinator;
use stager_metadata::coordinator::FilesBySe;
use stager_metadata::repos::{
    LinkCheckMode, ReplicaFilter, ReplicaOrderBy, ReplicaQuery, ReplicaResolution,
    ReplicaTimestamp,
};
use std::collections::BTreeMap;
use std::path::Path;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "stagerctl")]
#[command(about = "Operate the stager task and replica cache")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "STAGER_CONFIG", default_value = "config/stager.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a staging task
    Submit {
        /// Submitting system
        #[arg(long)]
        source: String,
        /// How completion is reported back
        #[arg(long)]
        callback: String,
        /// Caller's own correlation id
        #[arg(long)]
        source_task_id: String,
        /// File to stage, as SE=LFN (repeatable)
        #[arg(long = "file", required = true, value_parser = parse_file_spec)]
        files: Vec<(String, String)>,
    },
    /// Task commands
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Replica commands
    Replica {
        #[command(subcommand)]
        command: ReplicaCommands,
    },
    /// Stage request commands
    Stage {
        #[command(subcommand)]
        command: StageCommands,
    },
    /// Move complete stage completing tasks to Staged
    Finalize,
    /// Delete replicas no task references
    Gc,
    /// Compare stored link counts with the link table
    VerifyLinks {
        /// Rewrite mismatching counts
        #[arg(long, default_value_t = false)]
        fix: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Show a task
    Info { task_id: TaskId },
    /// Show a task with its replicas
    Summary { task_id: TaskId },
    /// List tasks in a status
    List {
        #[arg(long, default_value = "Submitted")]
        status: TaskStatus,
    },
    /// Move tasks to StageCompleting
    StageCompleting {
        #[arg(required = true)]
        task_ids: Vec<TaskId>,
    },
    /// Mark tasks done
    Done {
        #[arg(required = true)]
        task_ids: Vec<TaskId>,
    },
    /// Delete tasks and their links
    Remove {
        #[arg(required = true)]
        task_ids: Vec<TaskId>,
    },
}

#[derive(Subcommand)]
enum ReplicaCommands {
    /// Query cache replicas
    List(ReplicaListArgs),
    /// Waiting replicas ready for stage submission
    Waiting,
    /// Record a resolved physical location
    Resolve {
        replica_id: ReplicaId,
        pfn: String,
        size: i64,
    },
    /// Mark a replica failed
    Fail { replica_id: ReplicaId, reason: String },
    /// Cancel replicas
    Cancel {
        #[arg(required = true)]
        replica_ids: Vec<ReplicaId>,
    },
    /// Move staged replicas to Pinned
    Pin {
        #[arg(required = true)]
        replica_ids: Vec<ReplicaId>,
    },
    /// Pin usage per storage element
    Pins,
}

#[derive(Subcommand)]
enum StageCommands {
    /// Record a stage request issued to a backend
    Submit {
        /// Backend request handle
        #[arg(long)]
        request_id: String,
        /// Requested pin lifetime in seconds (default from configuration)
        #[arg(long)]
        pin_lifetime: Option<u64>,
        #[arg(required = true)]
        replica_ids: Vec<ReplicaId>,
    },
    /// Replicas with outstanding stage requests
    Submitted,
    /// Mark stage requests complete
    Complete {
        #[arg(required = true)]
        replica_ids: Vec<ReplicaId>,
    },
    /// Staged replicas awaiting pinning
    Staged,
}

#[derive(Args, Default)]
struct ReplicaListArgs {
    /// Only replicas linked to these tasks
    #[arg(long = "task")]
    task_ids: Vec<TaskId>,
    /// Only these replica ids
    #[arg(long = "id")]
    replica_ids: Vec<ReplicaId>,
    /// Only replicas in these statuses
    #[arg(long = "status")]
    statuses: Vec<ReplicaStatus>,
    /// Only replicas at this storage element
    #[arg(long)]
    se: Option<String>,
    /// Only these LFNs
    #[arg(long = "lfn")]
    lfns: Vec<String>,
    /// Only rows last updated (or submitted, with --by-submit-time) this many seconds ago or earlier
    #[arg(long)]
    older_than_secs: Option<i64>,
    /// Only rows last updated (or submitted) within this many seconds
    #[arg(long)]
    newer_than_secs: Option<i64>,
    /// Apply the time window to the submit time instead of the last update
    #[arg(long, default_value_t = false)]
    by_submit_time: bool,
    #[arg(long, value_enum)]
    order_by: Option<OrderArg>,
    #[arg(long, default_value_t = false)]
    desc: bool,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Id,
    Lfn,
    Se,
    Status,
    Size,
    SubmitTime,
    LastUpdate,
}

impl From<OrderArg> for ReplicaOrderBy {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Id => Self::ReplicaId,
            OrderArg::Lfn => Self::Lfn,
            OrderArg::Se => Self::Se,
            OrderArg::Status => Self::Status,
            OrderArg::Size => Self::Size,
            OrderArg::SubmitTime => Self::SubmitTime,
            OrderArg::LastUpdate => Self::LastUpdate,
        }
    }
}

impl ReplicaListArgs {
    fn into_query(self, now: OffsetDateTime) -> ReplicaQuery {
        fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
            (!values.is_empty()).then_some(values)
        }

        ReplicaQuery {
            filter: ReplicaFilter {
                replica_ids: non_empty(self.replica_ids),
                task_ids: non_empty(self.task_ids),
                statuses: non_empty(self.statuses),
                se: self.se,
                lfns: non_empty(self.lfns),
                replica_type: None,
            },
            older_than: self
                .older_than_secs
                .map(|secs| now - time::Duration::seconds(secs)),
            newer_than: self
                .newer_than_secs
                .map(|secs| now - time::Duration::seconds(secs)),
            timestamp: if self.by_submit_time {
                ReplicaTimestamp::SubmitTime
            } else {
                ReplicaTimestamp::LastUpdate
            },
            order_by: self.order_by.map(ReplicaOrderBy::from),
            descending: self.desc,
            limit: self.limit,
        }
    }
}

/// Parse `SE=LFN`.
fn parse_file_spec(spec: &str) -> std::result::Result<(String, String), String> {
    match spec.split_once('=') {
        Some((se, lfn)) if !se.trim().is_empty() && !lfn.trim().is_empty() => {
            Ok((se.trim().to_string(), lfn.trim().to_string()))
        }
        _ => Err(format!("expected SE=LFN, got '{spec}'")),
    }
}

fn group_files(files: Vec<(String, String)>) -> FilesBySe {
    let mut grouped = FilesBySe::new();
    for (se, lfn) in files {
        grouped.entry(se).or_default().push(lfn);
    }
    grouped
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("STAGER_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    // Logs go to stderr so stdout stays machine readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(Path::new(&config))?;
    let store = stager_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    let coordinator = StagingCoordinator::new(store, config.staging);

    run(&coordinator, command).await
}

async fn run(coordinator: &StagingCoordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Submit {
            source,
            callback,
            source_task_id,
            files,
        } => {
            let task_id = coordinator
                .set_request(&group_files(files), &source, &callback, &source_task_id)
                .await
                .context("failed to submit task")?;
            print_json(&serde_json::json!({ "task_id": task_id }))
        }
        Commands::Task { command } => handle_task_command(coordinator, command).await,
        Commands::Replica { command } => handle_replica_command(coordinator, command).await,
        Commands::Stage { command } => handle_stage_command(coordinator, command).await,
        Commands::Finalize => {
            let staged = coordinator
                .update_stage_completing_tasks()
                .await
                .context("failed to update stage completing tasks")?;
            print_json(&serde_json::json!({ "staged": staged }))
        }
        Commands::Gc => {
            let removed = coordinator
                .remove_unlinked_replicas()
                .await
                .context("failed to remove unlinked replicas")?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Commands::VerifyLinks { fix } => {
            let mode = if fix {
                LinkCheckMode::Correct
            } else {
                LinkCheckMode::DryRun
            };
            let report = coordinator
                .verify_link_counts(mode)
                .await
                .context("failed to verify link counts")?;
            print_json(&report)
        }
    }
}

async fn handle_task_command(coordinator: &StagingCoordinator, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Info { task_id } => {
            let task = coordinator
                .get_task_info(task_id)
                .await
                .with_context(|| format!("failed to get task {task_id}"))?;
            print_json(&task)
        }
        TaskCommands::Summary { task_id } => {
            let summary = coordinator
                .get_task_summary(task_id)
                .await
                .with_context(|| format!("failed to get summary of task {task_id}"))?;
            print_json(&summary)
        }
        TaskCommands::List { status } => {
            let tasks = coordinator
                .get_tasks_with_status(status)
                .await
                .context("failed to list tasks")?;
            print_json(&tasks)
        }
        TaskCommands::StageCompleting { task_ids } => {
            let moved = coordinator
                .set_tasks_stage_completing(&task_ids)
                .await
                .context("failed to update task status")?;
            print_json(&serde_json::json!({ "moved": moved }))
        }
        TaskCommands::Done { task_ids } => {
            let updated = coordinator
                .set_tasks_done(&task_ids)
                .await
                .context("failed to mark tasks done")?;
            print_json(&serde_json::json!({ "updated": updated }))
        }
        TaskCommands::Remove { task_ids } => {
            let removed = coordinator
                .remove_tasks(&task_ids)
                .await
                .context("failed to remove tasks")?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}

async fn handle_replica_command(
    coordinator: &StagingCoordinator,
    command: ReplicaCommands,
) -> Result<()> {
    match command {
        ReplicaCommands::List(args) => {
            let query = args.into_query(OffsetDateTime::now_utc());
            let replicas = coordinator
                .get_cache_replicas(&query)
                .await
                .context("failed to query replicas")?;
            print_json(&replicas)
        }
        ReplicaCommands::Waiting => {
            let replicas = coordinator
                .get_waiting_replicas()
                .await
                .context("failed to get waiting replicas")?;
            print_json(&replicas)
        }
        ReplicaCommands::Resolve {
            replica_id,
            pfn,
            size,
        } => {
            let updated = coordinator
                .update_replica_information(&[ReplicaResolution::new(replica_id, pfn, size)])
                .await
                .with_context(|| format!("failed to resolve replica {replica_id}"))?;
            print_json(&serde_json::json!({ "updated": updated }))
        }
        ReplicaCommands::Fail { replica_id, reason } => {
            let failures = BTreeMap::from([(replica_id, reason)]);
            let updated = coordinator
                .update_replica_failure(&failures)
                .await
                .with_context(|| format!("failed to mark replica {replica_id} failed"))?;
            print_json(&serde_json::json!({ "updated": updated }))
        }
        ReplicaCommands::Cancel { replica_ids } => {
            let cancelled = coordinator
                .cancel_replicas(&replica_ids)
                .await
                .context("failed to cancel replicas")?;
            print_json(&serde_json::json!({ "cancelled": cancelled }))
        }
        ReplicaCommands::Pin { replica_ids } => {
            let pinned = coordinator
                .pin_replicas(&replica_ids)
                .await
                .context("failed to pin replicas")?;
            print_json(&serde_json::json!({ "pinned": pinned }))
        }
        ReplicaCommands::Pins => {
            let pins = coordinator
                .get_submitted_stage_pins()
                .await
                .context("failed to get pin usage")?;
            print_json(&pins)
        }
    }
}

async fn handle_stage_command(coordinator: &StagingCoordinator, command: StageCommands) -> Result<()> {
    match command {
        StageCommands::Submit {
            request_id,
            pin_lifetime,
            replica_ids,
        } => {
            let requests = BTreeMap::from([(request_id, replica_ids)]);
            let inserted = coordinator
                .insert_stage_request(&requests, pin_lifetime)
                .await
                .context("failed to record stage request")?;
            print_json(&serde_json::json!({ "inserted": inserted }))
        }
        StageCommands::Submitted => {
            let replicas = coordinator
                .get_stage_submitted_replicas()
                .await
                .context("failed to get stage submitted replicas")?;
            print_json(&replicas)
        }
        StageCommands::Complete { replica_ids } => {
            let updated = coordinator
                .set_stage_complete(&replica_ids)
                .await
                .context("failed to complete stage requests")?;
            print_json(&serde_json::json!({ "updated": updated }))
        }
        StageCommands::Staged => {
            let replicas = coordinator
                .get_staged_replicas()
                .await
                .context("failed to get staged replicas")?;
            print_json(&replicas)
        }
    }
}
