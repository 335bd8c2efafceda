//! Buffered counter commands.

use anyhow::Result;
use std::path::Path;

use cronlease::counters::CounterAttribute;

use super::super::{Cli, CounterCommands};
use super::Runtime;

pub async fn cmd_counter(project_dir: &Path, cli: &Cli, command: &CounterCommands) -> Result<()> {
    let runtime = Runtime::open(project_dir, cli)?;
    let counters = CounterAttribute::new(
        runtime.db.clone(),
        runtime.lease.clone(),
        runtime.config.toml.counters.attributes.iter().cloned(),
    )
    .with_lock_options(runtime.config.toml.counters.lock_options());

    match command {
        CounterCommands::Incr {
            record,
            attribute,
            by,
        } => match counters.delayed_increment(record, attribute, *by).await? {
            Some(pending) => println!("{}.{} pending = {}", record, attribute, pending),
            None => println!("Increment of 0 ignored"),
        },
        CounterCommands::Flush { record, attribute } => {
            match counters.flush(record, attribute).await? {
                Some(flushed) => println!(
                    "{}.{} flushed {}: {} -> {}",
                    record, attribute, flushed.increment, flushed.previous_value, flushed.new_value
                ),
                None => println!("Nothing to flush for {}.{}", record, attribute),
            }
        }
        CounterCommands::Show { record, attribute } => {
            let value = counters.value(record, attribute).await?;
            let pending = counters.pending(record, attribute).await?;
            println!("{}.{}", record, attribute);
            println!("  value   = {}", value);
            println!("  pending = {}", pending);
        }
        CounterCommands::Clear { record, attribute } => {
            counters.clear(record, attribute).await?;
            println!("Cleared pending increments for {}.{}", record, attribute);
        }
    }
    Ok(())
}
