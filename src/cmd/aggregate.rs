//! Aggregation worker and seeding commands.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use cronlease::aggregation::{
    Aggregation, AggregationMode, AggregationReport, AggregationWorker, IncrementalStep,
    StopReason,
};
use cronlease_common::WorkerContext;

use super::super::{Cli, EventCommands, TargetCommands};
use super::Runtime;

pub async fn cmd_aggregate(
    project_dir: &Path,
    cli: &Cli,
    mode: Option<AggregationMode>,
    max_runtime: Option<u64>,
    json: bool,
) -> Result<()> {
    let mut runtime = Runtime::open(project_dir, cli)?;
    runtime.config.cli_max_runtime_secs = max_runtime;

    let options = runtime.config.worker_options(mode);
    let step = IncrementalStep::new(runtime.db.clone(), runtime.clock.clone())
        .with_page_size(runtime.config.toml.aggregation.step_page_size);
    let worker = AggregationWorker::new(runtime.db.clone(), Arc::new(step), options);
    let ctx = WorkerContext::new("aggregation_worker", runtime.clock.clone());

    let lock_options = runtime.config.toml.lease.lock_options();
    let Some(report) = worker
        .perform_exclusive(ctx, &runtime.lease, lock_options)
        .await?
    else {
        println!(
            "{}",
            console::style("Another aggregation worker is running; skipped.").yellow()
        );
        return Ok(());
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &AggregationReport) {
    println!();
    println!(
        "{} ({})",
        console::style("Aggregation finished").bold(),
        report.mode
    );
    println!("  Processed:   {}", report.processed);
    if report.failed > 0 {
        println!("  Failed:      {}", console::style(report.failed).red());
    }
    println!("  Records:     {}", report.records);
    println!(
        "  Elapsed:     {:.1}s of {:.0}s",
        report.usage.elapsed_seconds, report.usage.max_runtime_seconds
    );
    let reason = match report.stop_reason {
        StopReason::CaughtUp => console::style("caught_up").green(),
        StopReason::OverTime => console::style("over_time").yellow(),
    };
    println!("  Stop reason: {}", reason);
    println!();
}

pub async fn cmd_target(project_dir: &Path, cli: &Cli, command: &TargetCommands) -> Result<()> {
    let runtime = Runtime::open(project_dir, cli)?;

    match command.clone() {
        TargetCommands::Add { target_id } => {
            let aggregation = runtime
                .db
                .call(move |db| db.create_aggregation(target_id))
                .await?;
            println!(
                "Target {} registered (aggregation {})",
                aggregation.target_id, aggregation.id
            );
        }
        TargetCommands::List => {
            let aggregations = runtime.db.call(|db| db.list_aggregations()).await?;
            if aggregations.is_empty() {
                println!("No targets registered. Run 'cronlease target add <target_id>'.");
                return Ok(());
            }
            print_aggregations(&aggregations);
        }
        TargetCommands::Disable { target_id } => {
            set_enabled(&runtime, target_id, false).await?;
            println!("Target {} disabled", target_id);
        }
        TargetCommands::Enable { target_id } => {
            set_enabled(&runtime, target_id, true).await?;
            println!("Target {} enabled", target_id);
        }
    }
    Ok(())
}

async fn set_enabled(runtime: &Runtime, target_id: i64, enabled: bool) -> Result<()> {
    runtime
        .db
        .call(move |db| {
            let aggregation = db
                .get_aggregation_by_target(target_id)?
                .with_context(|| format!("Target {} is not registered", target_id))?;
            db.set_aggregation_enabled(aggregation.id, enabled)
        })
        .await
}

fn print_aggregations(aggregations: &[Aggregation]) {
    println!(
        "{:<8} {:<8} {:<12} {:<10} {:<24} {:<24} Avg runtime",
        "Target", "Enabled", "Total", "Records", "Last incremental run", "Last full run"
    );
    println!(
        "{:<8} {:<8} {:<12} {:<10} {:<24} {:<24} -----------",
        "------", "-------", "-----", "-------", "--------------------", "-------------"
    );
    for aggregation in aggregations {
        let average = aggregation
            .incremental_stats
            .average_runtime()
            .map(|secs| format!("{:.3}s", secs))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<8} {:<12} {:<10} {:<24} {:<24} {}",
            aggregation.target_id,
            aggregation.enabled,
            aggregation.total_value,
            aggregation.processed_records,
            format_time(aggregation.last_run_at(AggregationMode::Incremental)),
            format_time(aggregation.last_run_at(AggregationMode::Full)),
            average
        );
    }
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub async fn cmd_event(project_dir: &Path, cli: &Cli, command: &EventCommands) -> Result<()> {
    let runtime = Runtime::open(project_dir, cli)?;

    match command.clone() {
        EventCommands::Add { target_id, value } => {
            let now = runtime.clock.now();
            let event = runtime
                .db
                .call(move |db| {
                    if db.get_aggregation_by_target(target_id)?.is_none() {
                        anyhow::bail!(
                            "Target {} is not registered. Run 'cronlease target add {}' first.",
                            target_id,
                            target_id
                        );
                    }
                    db.add_event(target_id, value, now)
                })
                .await?;
            println!(
                "Event {} added to target {} (value {})",
                event.id, event.target_id, event.value
            );
        }
    }
    Ok(())
}
