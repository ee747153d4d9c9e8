use clap::Parser;

use crate::{BuildRequest, output::OutputMode};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Build file to use
    #[arg(short = 'f', long = "file", default_value = "keel.toml")]
    pub file: String,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Override number of worker threads for parallel execution
    #[arg(short = 'j', long = "workers")]
    pub workers: Option<usize>,

    /// Override default timeout (e.g., "5m", "30s", "1h30m")
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<String>,

    /// Show what would be executed without running tasks
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Continue executing independent tasks even if some fail
    #[arg(long = "continue-on-failure")]
    pub continue_on_failure: bool,

    /// How to display task output in the terminal
    #[arg(long = "output", value_enum)]
    pub output: Option<OutputMode>,

    /// List the tasks of every module and exit
    #[arg(long = "list")]
    pub list: bool,

    /// Tasks to run, as `:module:task` paths or bare names matched in every
    /// module. Runs the default task or all tasks if none are given
    pub tasks: Vec<String>,
}

impl Cli {
    pub fn build_request(&self) -> BuildRequest {
        BuildRequest {
            targets: self.tasks.clone(),
            workers: self.workers,
            timeout: self.timeout.clone(),
            continue_on_failure: self.continue_on_failure,
            output: self.output,
            dry_run: self.dry_run,
        }
    }
}
