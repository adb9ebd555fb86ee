//! Shared setup for commands that run the acquire engine.

use std::path::PathBuf;
use std::sync::Arc;

use console::{style, Term};
use debfetch::{interrupt, Acquire, AcquireConfig, ConfigFile, DefaultTransports, RunResult, RunSummary};
use tracing::{debug, info};

use crate::error::CliError;

/// Options every command accepts.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
}

/// Loads configuration and drives one acquire run.
pub struct CliRunner {
    config: AcquireConfig,
    json: bool,
    progress: bool,
}

impl CliRunner {
    pub fn new(options: &GlobalOptions) -> Result<Self, CliError> {
        let file = match &options.config {
            Some(path) => ConfigFile::load_from(path)?,
            None => ConfigFile::load()?,
        };
        let mut config = file.into_acquire_config();
        if let Some(dir) = &options.state_dir {
            config = config.with_lists_dir(dir.join("lists"));
        }
        if let Some(dir) = &options.cache_dir {
            config = config.with_archives_dir(dir.join("archives"));
        }

        Ok(Self {
            config,
            json: options.json,
            progress: !options.json && !options.quiet && Term::stderr().is_term(),
        })
    }

    pub fn config(&self) -> &AcquireConfig {
        &self.config
    }

    /// An engine with the built-in transports and terminal progress.
    pub fn engine(&self) -> Result<Acquire, CliError> {
        let acquire = Acquire::new(self.config.clone(), Arc::new(DefaultTransports::new()))?
            .with_status(Box::new(crate::progress::TerminalStatus::new(self.progress)));
        Ok(acquire)
    }

    /// Run `acquire` to completion. Ctrl+C cancels the run.
    pub fn run(&self, acquire: &mut Acquire) -> Result<RunResult, CliError> {
        let token = acquire.cancellation_token();
        ctrlc::set_handler(move || {
            // leave the partial file resumable
            if let Some(path) = interrupt::finalize() {
                debug!(path = %path.display(), "partial download kept");
            }
            token.cancel();
        })
        .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| CliError::Config(format!("Failed to start runtime: {}", e)))?;

        let result = runtime.block_on(acquire.run())?;
        info!(?result, "run complete");
        Ok(result)
    }

    /// Print the outcome of a run, as text or JSON.
    pub fn report(&self, result: RunResult, summary: &RunSummary) -> Result<(), CliError> {
        if self.json {
            let report = serde_json::json!({
                "result": result,
                "summary": summary,
            });
            let text = serde_json::to_string_pretty(&report).map_err(|e| CliError::Output(e.to_string()))?;
            println!("{}", text);
            return Ok(());
        }

        for warning in &summary.warnings {
            eprintln!("{} {}", style("W:").yellow().bold(), warning);
        }
        for failure in &summary.failures {
            eprintln!(
                "{} Failed to fetch {}  {}",
                style("E:").red().bold(),
                failure.uri,
                failure.error
            );
        }
        match result {
            RunResult::Continue => {}
            RunResult::Failed => eprintln!(
                "{} Some files failed to download. They have been ignored, or old ones used instead.",
                style("E:").red().bold()
            ),
            RunResult::Cancelled => eprintln!("Interrupted."),
        }
        if summary.items_transient > 0 {
            eprintln!(
                "{} {} files could not be reached; the previous copies are still in use.",
                style("W:").yellow().bold(),
                summary.items_transient
            );
        }
        Ok(())
    }
}
