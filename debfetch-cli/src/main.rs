//! debfetch CLI - refresh Debian repository indexes and fetch files.
//!
//! ```text
//! debfetch update --source "deb http://deb.debian.org/debian bookworm main"
//! debfetch fetch http://deb.debian.org/debian/README --dest /tmp
//! debfetch clean
//! ```

mod commands;
mod error;
mod progress;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use debfetch::RunResult;
use tracing_subscriber::EnvFilter;

use crate::commands::{clean, fetch, update};
use crate::error::CliError;
use crate::runner::GlobalOptions;

/// Exit status for failed or interrupted runs.
const EXIT_FAILURE: u8 = 100;

#[derive(Parser)]
#[command(name = "debfetch")]
#[command(about = "Download Debian repository metadata and files")]
#[command(version = debfetch::VERSION)]
struct Cli {
    /// Configuration file (default: <config dir>/debfetch/config.ini)
    #[arg(long, short = 'c', env = "DEBFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// State directory; lists go below `<dir>/lists`
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Cache directory; archives go below `<dir>/archives`
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,

    /// No progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh release files and package indexes
    Update {
        /// Sources line, e.g. "deb http://deb.debian.org/debian bookworm main"
        #[arg(long = "source", short = 's')]
        sources: Vec<String>,

        /// File with one sources line per entry
        #[arg(long, short = 'f')]
        sources_file: Option<PathBuf>,

        /// Package architecture
        #[arg(long, short = 'a', default_value = "amd64")]
        arch: String,

        /// Also fetch Translation files for these languages
        #[arg(long = "lang", short = 'l')]
        languages: Vec<String>,

        /// Skip InRelease and use Release with Release.gpg
        #[arg(long)]
        no_inrelease: bool,
    },

    /// Download files by URI
    Fetch {
        /// URIs to download
        #[arg(required = true)]
        uris: Vec<String>,

        /// Destination directory
        #[arg(long, short = 'd', default_value = ".")]
        dest: PathBuf,

        /// Expected hash as TYPE:HEX, e.g. SHA256:ab12...
        #[arg(long)]
        hash: Option<String>,

        /// Expected size in bytes
        #[arg(long)]
        size: Option<u64>,
    },

    /// Remove downloaded archives
    Clean,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = GlobalOptions {
        config: cli.config,
        state_dir: cli.state_dir,
        cache_dir: cli.cache_dir,
        json: cli.json,
        quiet: cli.quiet,
    };

    let result: Result<RunResult, CliError> = match cli.command {
        Commands::Update {
            sources,
            sources_file,
            arch,
            languages,
            no_inrelease,
        } => update::run(
            &options,
            update::UpdateArgs {
                sources,
                sources_file,
                arch,
                languages,
                no_inrelease,
            },
        ),
        Commands::Fetch {
            uris,
            dest,
            hash,
            size,
        } => fetch::run(
            &options,
            fetch::FetchArgs {
                uris,
                dest,
                hash,
                size,
            },
        ),
        Commands::Clean => clean::run(&options).map(|()| RunResult::Continue),
    };

    match result {
        Ok(RunResult::Continue) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_FAILURE),
        Err(e) => {
            eprintln!("{} {}", console::style("E:").red().bold(), e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Log to stderr. `RUST_LOG` overrides the level.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
