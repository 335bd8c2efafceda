//! `cronlease init`: create the `.cronlease/` directory in a project.
//!
//! ```text
//! .cronlease/
//! ├── cronlease.toml   # Configuration with every default spelled out
//! └── cronlease.db     # Shared SQLite state (cursors, hooks, counters, leases)
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_DIR, CONFIG_FILE, CronleaseToml, DB_FILE};
use crate::store::Db;

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the .cronlease directory
    pub config_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
    /// Whether cronlease.toml was written by this call
    pub wrote_config: bool,
}

/// Initialize cronlease in `project_dir`.
///
/// Safe to run repeatedly: an existing cronlease.toml is never overwritten,
/// and database migrations are additive.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let created = !config_dir.exists();

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;

    let config_path = config_dir.join(CONFIG_FILE);
    let wrote_config = !config_path.exists();
    if wrote_config {
        CronleaseToml::default().save(&config_path)?;
    }

    let db_path = config_dir.join(DB_FILE);
    Db::new(&db_path)
        .with_context(|| format!("Failed to initialize database: {}", db_path.display()))?;

    Ok(InitResult {
        config_dir,
        created,
        wrote_config,
    })
}

/// Check if a project is already initialized.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE).exists()
}
