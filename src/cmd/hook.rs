//! Webhook management commands.

use anyhow::{Context, Result};
use std::path::Path;

use cronlease::hooks::{DeliveryOutcome, FailureStateUpdate, FailureStateUpdater, HookDelivery, WebHook};

use super::super::{Cli, HookCommands};
use super::Runtime;

fn updater(runtime: &Runtime) -> FailureStateUpdater {
    FailureStateUpdater::new(
        runtime.db.clone(),
        runtime.lease.clone(),
        runtime.clock.clone(),
    )
    .with_lock_options(runtime.config.toml.hooks.lock_options())
}

pub async fn cmd_hook(project_dir: &Path, cli: &Cli, command: &HookCommands) -> Result<()> {
    let runtime = Runtime::open(project_dir, cli)?;

    match command.clone() {
        HookCommands::Add { project_id, url } => {
            let hook = runtime
                .db
                .call(move |db| db.create_web_hook(project_id, &url))
                .await?;
            println!("Web hook {} added for project {}", hook.id, hook.project_id);
        }
        HookCommands::List => {
            let hooks = runtime.db.call(|db| db.list_web_hooks()).await?;
            if hooks.is_empty() {
                println!("No web hooks. Run 'cronlease hook add <project_id> <url>'.");
                return Ok(());
            }
            print_hooks(&runtime, &hooks);
        }
        HookCommands::Record { hook_id, category } => {
            let update = updater(&runtime).update(hook_id, category).await?;
            print_update(&runtime, &update);
        }
        HookCommands::Deliver {
            hook_id,
            event,
            payload,
        } => {
            let payload: serde_json::Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("Payload is not valid JSON")?,
                None => serde_json::json!({}),
            };
            let delivery = HookDelivery::new(
                runtime.db.clone(),
                updater(&runtime),
                runtime.clock.clone(),
                runtime.config.toml.hooks.delivery_timeout(),
            )?;

            match delivery.execute(hook_id, &event, &payload).await? {
                DeliveryOutcome::Skipped { status } => {
                    println!(
                        "{} hook {} is {}",
                        console::style("Skipped:").yellow(),
                        hook_id,
                        status
                    );
                }
                DeliveryOutcome::Delivered {
                    category,
                    http_status,
                    update,
                } => {
                    let status = http_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "no response".to_string());
                    println!("Delivered: {} ({})", category, status);
                    print_update(&runtime, &update);
                }
            }
        }
    }
    Ok(())
}

fn print_update(runtime: &Runtime, update: &FailureStateUpdate) {
    let hook = update.hook();
    let note = match update {
        FailureStateUpdate::Applied { changed: true, .. } => "updated",
        FailureStateUpdate::Applied { changed: false, .. } => "unchanged",
        FailureStateUpdate::AlreadyConsistent { .. } => "already consistent",
    };
    println!(
        "Web hook {}: {} ({})",
        hook.id,
        hook.status(runtime.clock.now()),
        note
    );
    println!(
        "  recent_failures = {}, backoff_count = {}",
        hook.recent_failures, hook.backoff_count
    );
}

fn print_hooks(runtime: &Runtime, hooks: &[WebHook]) {
    let now = runtime.clock.now();
    println!(
        "{:<6} {:<8} {:<9} {:<8} {:<40} URL",
        "ID", "Project", "Failures", "Backoff", "Status"
    );
    println!(
        "{:<6} {:<8} {:<9} {:<8} {:<40} ---",
        "--", "-------", "--------", "-------", "------"
    );
    for hook in hooks {
        let status = hook.status(now).to_string();
        let status = if hook.executable(now) {
            console::style(status).green()
        } else {
            console::style(status).red()
        };
        println!(
            "{:<6} {:<8} {:<9} {:<8} {:<40} {}",
            hook.id, hook.project_id, hook.recent_failures, hook.backoff_count, status, hook.url
        );
    }
}
