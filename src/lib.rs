//! Incremental multi-module build runner.
//!
//! A TOML file declares modules and their tasks. Each invocation resolves the
//! requested targets into a dependency DAG, skips tasks whose fingerprints
//! are unchanged, and runs the rest in parallel in topological order.

pub mod action;
pub mod cache;
pub mod clean;
pub mod cli;
pub mod error;
pub mod execution;
pub mod output;
pub mod task;
pub mod util;

use tracing::debug;

pub use error::{ActionError, KeelError, Result};
pub use execution::{BuildReport, RunOptions, TaskReport, TaskState};
pub use task::{Action, TaskConfiguration, TaskDescriptor, TaskPath, load_tasks};

use cache::{load_cache, save_cache};
use clean::clean_outputs;
use execution::TaskRunner;
use output::OutputMode;
use task::{plan_execution, resolve_targets, show_task_relationships};

/// Name of the built-in clean target, used unless a module defines its own.
pub const CLEAN_TASK: &str = "clean";

/// One invocation: targets plus the overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub targets: Vec<String>,
    pub workers: Option<usize>,
    pub timeout: Option<String>,
    pub continue_on_failure: bool,
    pub output: Option<OutputMode>,
    pub dry_run: bool,
}

impl BuildRequest {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

pub async fn run(config: &TaskConfiguration, request: &BuildRequest) -> Result<BuildReport> {
    let mut cache = load_cache(&config.cache_file);
    let mut cleaned = false;

    let mut targets = request.targets.clone();
    if targets.is_empty() {
        targets.extend(config.default_task.clone());
    }

    let builtin_clean = !config.tasks.iter().any(|t| t.path.name() == CLEAN_TASK);
    if builtin_clean && targets.iter().any(|t| t == CLEAN_TASK) {
        targets.retain(|t| t != CLEAN_TASK);

        if request.dry_run {
            println!("Dry run mode - clean would remove all declared outputs");
        } else {
            clean_outputs(&config.tasks, &mut cache)?;
            cleaned = true;
        }

        if targets.is_empty() {
            if cleaned {
                save_cache(&cache, &config.cache_file);
            }
            return Ok(BuildReport {
                cache_changed: cleaned,
                ..BuildReport::default()
            });
        }
    }

    let selected = if targets.is_empty() {
        config.tasks.iter().map(|t| t.path.clone()).collect()
    } else {
        resolve_targets(&config.tasks, &targets)?
    };
    let plan = plan_execution(&config.tasks, &selected)?;

    show_task_relationships(&config.tasks);
    debug!(
        "Task execution order: {}",
        plan.order
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    if request.dry_run {
        println!("Dry run mode - showing what would be executed:");
        for path in &plan.order {
            if let Some(task) = config.task(path) {
                println!("  {} would run: {}", task.path, task.action.describe());
            }
        }
        return Ok(BuildReport::default());
    }

    let options = RunOptions {
        workers: request.workers.or(config.workers),
        default_timeout: request
            .timeout
            .clone()
            .or_else(|| config.default_timeout.clone()),
        continue_on_failure: request.continue_on_failure,
        output_mode: request.output.or(config.output).unwrap_or_default(),
    };

    let mut runner = TaskRunner::new(&config.tasks, &mut cache, options);
    let mut report = runner.run_plan(&plan).await;
    report.cache_changed |= cleaned;

    if report.cache_changed {
        save_cache(&cache, &config.cache_file);
    } else {
        debug!("No changes detected, cache not saved.");
    }

    Ok(report)
}
