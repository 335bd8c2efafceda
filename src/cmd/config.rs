//! Configuration view and validation commands: `cronlease config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use cronlease::config::{CONFIG_DIR, CONFIG_FILE, CronleaseConfig, CronleaseToml};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("cronlease Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                CronleaseToml::load(&config_path)?
            } else {
                println!("No cronlease.toml found at {}", config_path.display());
                println!("Using default configuration.");
                CronleaseToml::default()
            };
            println!();
            print_toml(&toml);

            if config_path.exists() {
                println!("Effective values (with env/CLI overrides):");
                let config = CronleaseConfig::new(project_dir.to_path_buf())?;
                println!("  max_runtime_secs = {}", config.max_runtime().as_secs());
                println!("  log_level = \"{}\"", config.log_level());
                println!("  db_path = \"{}\"", config.db_path().display());
                println!();
            } else {
                println!("Run 'cronlease config init' to create a cronlease.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No cronlease.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = CronleaseToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("cronlease.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)?;
            CronleaseToml::default().save(&config_path)?;

            println!("Created cronlease.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [lease] backend, ttl_secs, retries");
            println!("  - [aggregation] max_runtime_secs, batch_size, mode");
            println!("  - [counters] attributes");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &cronlease::config::CronleaseToml) {
    println!("[lease]");
    println!("  backend = \"{}\"", toml.lease.backend);
    println!("  ttl_secs = {}", toml.lease.ttl_secs);
    println!("  sleep_ms = {}", toml.lease.sleep_ms);
    println!("  retries = {}", toml.lease.retries);
    println!();

    println!("[aggregation]");
    println!("  max_runtime_secs = {}", toml.aggregation.max_runtime_secs);
    println!("  batch_size = {}", toml.aggregation.batch_size);
    println!("  step_page_size = {}", toml.aggregation.step_page_size);
    println!("  mode = \"{}\"", toml.aggregation.mode);
    println!();

    println!("[hooks]");
    println!("  lock_ttl_secs = {}", toml.hooks.lock_ttl_secs);
    println!("  lock_sleep_ms = {}", toml.hooks.lock_sleep_ms);
    println!("  lock_retries = {}", toml.hooks.lock_retries);
    println!(
        "  delivery_timeout_secs = {}",
        toml.hooks.delivery_timeout_secs
    );
    println!();

    println!("[counters]");
    println!("  attributes = {:?}", toml.counters.attributes);
    println!("  lock_ttl_secs = {}", toml.counters.lock_ttl_secs);
    println!("  lock_retries = {}", toml.counters.lock_retries);
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = \"{}\"", toml.logging.format);
    println!();
}
