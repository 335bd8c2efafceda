//! Project setup and status commands.

use anyhow::Result;
use std::path::Path;

use super::super::Cli;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use cronlease::init::{init_project, is_initialized};

    if is_initialized(project_dir) {
        let result = init_project(project_dir)?;
        println!(
            "cronlease already initialized at {}",
            result.config_dir.display()
        );
        return Ok(());
    }

    let result = init_project(project_dir)?;
    println!(
        "{} {}",
        console::style("Initialized cronlease project at").green(),
        result.config_dir.display()
    );
    println!();
    println!("Next steps:");
    println!("  cronlease target add <target_id>");
    println!("  cronlease event add <target_id> <value>");
    println!("  cronlease aggregate");
    Ok(())
}

pub fn cmd_status(project_dir: &Path, cli: &Cli) -> Result<()> {
    use cronlease::config::CronleaseConfig;
    use cronlease::init::is_initialized;
    use cronlease::store::Db;

    println!();
    if !is_initialized(project_dir) && cli.db_path.is_none() {
        println!("Not initialized. Run 'cronlease init' first.");
        println!();
        return Ok(());
    }

    let config =
        CronleaseConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, cli.db_path.clone())?;
    let db_path = config.db_path();

    println!("{}", console::style("Initialized").bold().green());
    println!("  Config:   {}", config.config_file().display());
    println!("  Database: {}", db_path.display());
    println!("  Leases:   {}", config.toml.lease.backend);
    println!();

    let db = Db::new(&db_path)?;
    let purged = db.purge_expired_leases(chrono::Utc::now())?;
    if purged > 0 {
        println!("Purged {} expired lease(s)", purged);
        println!();
    }
    println!("{:<14} Rows", "Table");
    println!("{:<14} ----", "--------------");
    for (table, count) in db.table_counts()? {
        println!("{:<14} {}", table, count);
    }
    println!();
    Ok(())
}
