use std::{io, path::PathBuf};

use glob::{GlobError, PatternError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeelError {
    #[error("Task error: {0}")]
    Task(String),
    #[error("Dependency error: {0}")]
    Dependency(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("File error: {0}")]
    File(#[from] FileError),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Invalid glob pattern: {0}")]
    GlobPattern(#[from] PatternError),
    #[error("Failed to expand glob: {0}")]
    GlobExpansion(#[from] GlobError),
    #[error("IO error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FileError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command execution error: {0}")]
    Io(#[from] io::Error),
    #[error("Command timed out")]
    Timeout,
    #[error("Empty command line")]
    Empty,
}

/// Failure of a single task action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The external tool ran and exited unsuccessfully.
    #[error("'{tool}' exited with {status}{}", render_captured(.stdout, .stderr))]
    ExternalTool {
        tool: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("Missing input: '{}' does not exist", .0.display())]
    MissingInput(PathBuf),

    #[error("{metric} {observed:.4} is below the minimum of {minimum:.4}")]
    GateThreshold {
        metric: String,
        observed: f64,
        minimum: f64,
    },

    #[error("Invalid report '{}': {source}", .path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Coverage counters overflow when adding '{}'", .0.display())]
    CounterOverflow(PathBuf),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    File(#[from] FileError),
}

impl ActionError {
    /// Failures a report-only gate is allowed to swallow.
    pub fn is_gate_failure(&self) -> bool {
        matches!(
            self,
            ActionError::ExternalTool { .. } | ActionError::GateThreshold { .. }
        )
    }
}

fn render_captured(stdout: &str, stderr: &str) -> String {
    let mut rendered = String::new();
    for stream in [stdout.trim_end(), stderr.trim_end()] {
        if !stream.is_empty() {
            rendered.push('\n');
            rendered.push_str(stream);
        }
    }
    rendered
}

pub type Result<T> = std::result::Result<T, KeelError>;
