use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cronlease::aggregation::AggregationMode;
use cronlease::hooks::ResponseCategory;

mod cmd;

#[derive(Parser)]
#[command(name = "cronlease")]
#[command(
    version,
    about = "Lease-guarded, time-boxed background workers for cron schedules"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Database path. Defaults to .cronlease/cronlease.db
    #[arg(long, global = true, env = "CRONLEASE_DB")]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .cronlease/ with a default config and database
    Init,
    /// Show database location and row counts
    Status,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Run one time-boxed aggregation pass
    Aggregate {
        /// incremental or full. Defaults to aggregation.mode from cronlease.toml
        #[arg(long)]
        mode: Option<AggregationMode>,

        /// Runtime budget in seconds. Overrides CRONLEASE_MAX_RUNTIME and the config file
        #[arg(long)]
        max_runtime: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage aggregation targets
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Record source events for aggregation
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Manage webhooks and their failure state
    Hook {
        #[command(subcommand)]
        command: HookCommands,
    },
    /// Buffered counter attributes
    Counter {
        #[command(subcommand)]
        command: CounterCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default cronlease.toml file
    Init,
}

#[derive(Subcommand, Clone)]
pub enum TargetCommands {
    /// Register a target for aggregation
    Add { target_id: i64 },
    /// List aggregations with their cursors and totals
    List,
    /// Stop aggregating a target
    Disable { target_id: i64 },
    /// Resume aggregating a target
    Enable { target_id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum EventCommands {
    /// Add a source event for a target
    Add {
        target_id: i64,
        #[arg(allow_negative_numbers = true)]
        value: i64,
    },
}

#[derive(Subcommand, Clone)]
pub enum HookCommands {
    /// Register a webhook for a project
    Add { project_id: i64, url: String },
    /// List webhooks with their failure state
    List,
    /// Record a delivery outcome (ok, error, failed) without sending anything
    Record {
        hook_id: i64,
        category: ResponseCategory,
    },
    /// POST a payload to the hook and record the outcome
    Deliver {
        hook_id: i64,

        #[arg(long, default_value = "push")]
        event: String,

        /// JSON payload. Defaults to an empty object
        #[arg(long)]
        payload: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum CounterCommands {
    /// Buffer an increment
    Incr {
        record: String,
        attribute: String,
        #[arg(allow_negative_numbers = true)]
        by: i64,
    },
    /// Move buffered increments into the durable value
    Flush { record: String, attribute: String },
    /// Show durable and pending values
    Show { record: String, attribute: String },
    /// Drop buffered increments
    Clear { record: String, attribute: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Status => cmd::cmd_status(&project_dir, &cli)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Aggregate {
            mode,
            max_runtime,
            json,
        } => cmd::cmd_aggregate(&project_dir, &cli, *mode, *max_runtime, *json).await?,
        Commands::Target { command } => cmd::cmd_target(&project_dir, &cli, command).await?,
        Commands::Event { command } => cmd::cmd_event(&project_dir, &cli, command).await?,
        Commands::Hook { command } => cmd::cmd_hook(&project_dir, &cli, command).await?,
        Commands::Counter { command } => cmd::cmd_counter(&project_dir, &cli, command).await?,
    }

    Ok(())
}
