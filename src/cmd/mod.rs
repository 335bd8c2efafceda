//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module        | Commands handled                    |
//! |---------------|-------------------------------------|
//! | `project`     | `Init`, `Status`                    |
//! | `config`      | `Config`                            |
//! | `aggregate`   | `Aggregate`, `Target`, `Event`      |
//! | `hook`        | `Hook`                              |
//! | `counter`     | `Counter`                           |

pub mod aggregate;
pub mod config;
pub mod counter;
pub mod hook;
pub mod project;

pub use aggregate::{cmd_aggregate, cmd_event, cmd_target};
pub use config::cmd_config;
pub use counter::cmd_counter;
pub use hook::cmd_hook;
pub use project::{cmd_init, cmd_status};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use cronlease::config::{CronleaseConfig, LeaseBackendKind};
use cronlease::init::is_initialized;
use cronlease::lease::{ExclusiveLease, LeaseBackend, MemoryLeaseBackend, SqliteLeaseBackend};
use cronlease::store::DbHandle;
use cronlease_common::{SharedClock, SystemClock};

use super::Cli;

/// Everything a worker command needs: resolved config, database, clock and
/// the configured lease backend.
pub struct Runtime {
    pub config: CronleaseConfig,
    pub db: DbHandle,
    pub clock: SharedClock,
    pub lease: ExclusiveLease,
}

impl Runtime {
    /// Resolve configuration, install logging and open the database.
    ///
    /// Fails when the project was never initialized, unless `--db-path`
    /// points somewhere explicit.
    pub fn open(project_dir: &Path, cli: &Cli) -> Result<Self> {
        if cli.db_path.is_none() && !is_initialized(project_dir) {
            anyhow::bail!("Not initialized. Run 'cronlease init' first.");
        }

        let config = CronleaseConfig::with_cli_args(
            project_dir.to_path_buf(),
            cli.verbose,
            cli.db_path.clone(),
        )?;
        cronlease::logging::init(&config);

        let db_path = config.db_path();
        let db = DbHandle::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        let clock = SystemClock::shared();

        let backend: Arc<dyn LeaseBackend> = match config.toml.lease.backend {
            LeaseBackendKind::Sqlite => Arc::new(SqliteLeaseBackend::new(db.clone(), clock.clone())),
            LeaseBackendKind::Memory => Arc::new(MemoryLeaseBackend::new(clock.clone())),
        };

        Ok(Self {
            config,
            db,
            clock,
            lease: ExclusiveLease::new(backend),
        })
    }
}
