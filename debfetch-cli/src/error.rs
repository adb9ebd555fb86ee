//! CLI error types.

use std::fmt;

use debfetch::config::ConfigError;
use debfetch::AcquireError;

/// Errors that can occur while running a CLI command.
#[derive(Debug)]
pub enum CliError {
    /// Configuration or argument error.
    Config(String),
    /// The acquire engine failed.
    Acquire(AcquireError),
    /// A sources line could not be understood.
    Source { line: String, reason: String },
    /// Cleaning a directory failed.
    Clean(String),
    /// Output could not be written.
    Output(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Acquire(e) => write!(f, "{}", e),
            CliError::Source { line, reason } => {
                write!(f, "Malformed source line '{}': {}", line, reason)
            }
            CliError::Clean(msg) => write!(f, "Failed to clean: {}", msg),
            CliError::Output(msg) => write!(f, "Failed to write output: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<AcquireError> for CliError {
    fn from(e: AcquireError) -> Self {
        CliError::Acquire(e)
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}
