//! Clean command - remove downloaded archives.

use std::path::Path;

use console::style;
use tracing::info;

use crate::error::CliError;
use crate::runner::{CliRunner, GlobalOptions};

/// Run the clean command.
pub fn run(options: &GlobalOptions) -> Result<(), CliError> {
    let runner = CliRunner::new(options)?;
    // nothing queued, so every archive is unreferenced
    let acquire = runner.engine()?;

    let config = runner.config();
    let mut removed = 0;
    for dir in [config.archives_dir.clone(), config.archives_partial_dir()] {
        removed += clean_dir(&acquire, &dir)?;
    }

    info!(removed, "clean complete");
    if !options.quiet {
        println!("{} Removed {} files", style("✓").green(), removed);
    }
    Ok(())
}

fn clean_dir(acquire: &debfetch::Acquire, dir: &Path) -> Result<usize, CliError> {
    if !dir.is_dir() {
        return Ok(0);
    }
    acquire
        .clean(dir)
        .map_err(|e| CliError::Clean(format!("{}: {}", dir.display(), e)))
}
