use std::{
    fs,
    path::{Path, PathBuf},
    process::Output,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{ActionError, FileError},
    task::{Action, TaskDescriptor},
    util::{CommandLine, expand_paths, is_glob_pattern, remove_paths, run_command_with_timeout, walk_dir},
};

/// Per-run settings an action needs.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub timeout: Option<Duration>,
    pub stream_output: bool,
}

/// What a successful action leaves behind for display and reporting.
#[derive(Debug, Default)]
pub struct ActionReport {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub warnings: Vec<String>,
}

impl ActionReport {
    fn from_output(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            warnings: Vec::new(),
        }
    }
}

/// Coverage counters as written by the test runner, one file per test suite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageCounters {
    pub covered: u64,
    pub missed: u64,
}

impl CoverageCounters {
    pub fn ratio(&self) -> f64 {
        let total = self.covered as f64 + self.missed as f64;
        if total == 0.0 {
            1.0
        } else {
            self.covered as f64 / total
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoverageReport {
    pub covered: u64,
    pub missed: u64,
    pub ratio: f64,
    pub minimum: Option<f64>,
    pub passed: bool,
}

pub async fn run_action(task: &TaskDescriptor, ctx: ActionContext) -> Result<ActionReport, ActionError> {
    check_inputs(task)?;

    match &task.action {
        Action::Lifecycle => Ok(ActionReport::default()),
        Action::Exec {
            command,
            working_dir,
        } => {
            let output = run_tool(
                command,
                &CommandLine::Shell(command.clone()),
                working_dir.as_deref(),
                ctx,
            )
            .await?;
            Ok(ActionReport::from_output(output))
        }
        Action::Compile {
            compiler,
            source_dir,
            entry,
            output,
            output_flag,
        } => {
            for required in [source_dir, entry] {
                if !required.exists() {
                    return Err(ActionError::MissingInput(required.clone()));
                }
            }
            create_parent(output)?;

            let mut argv = compiler.clone();
            argv.push(entry.to_string_lossy().into_owned());
            argv.push(output_flag.clone());
            argv.push(output.to_string_lossy().into_owned());

            let tool = compiler.first().map(String::as_str).unwrap_or_default();
            let result = run_tool(tool, &CommandLine::Argv(argv), Some(source_dir), ctx).await?;
            Ok(ActionReport::from_output(result))
        }
        Action::Copy { sources, into, .. } => {
            let copied = copy_into(sources, into).await?;
            debug!("Copied {} file(s) into {}", copied.len(), into.display());
            Ok(ActionReport::default())
        }
        Action::Delete { paths } => {
            let removed = remove_paths(paths)?;
            debug!("Deleted {} path(s)", removed.len());
            Ok(ActionReport::default())
        }
        Action::Analyze {
            command,
            report,
            working_dir,
        } => {
            if let Some(parent) = report.parent() {
                fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))?;
            }
            let output = run_tool(
                command,
                &CommandLine::Shell(command.clone()),
                Some(working_dir),
                ctx,
            ).await?;
            let mut result = ActionReport::from_output(output);
            if !report.exists() {
                result
                    .warnings
                    .push(format!("Analyzer did not write report '{}'", report.display()));
            }
            Ok(result)
        }
        Action::Coverage {
            data,
            report,
            minimum,
        } => verify_coverage(data, report, *minimum),
    }
}

/// Declared inputs must exist when the task starts. Globs may match nothing.
fn check_inputs(task: &TaskDescriptor) -> Result<(), ActionError> {
    for input in &task.inputs {
        if !is_glob_pattern(&input.to_string_lossy()) && !input.exists() {
            return Err(ActionError::MissingInput(input.clone()));
        }
    }
    Ok(())
}

async fn run_tool(
    tool: &str,
    command: &CommandLine,
    working_dir: Option<&Path>,
    ctx: ActionContext,
) -> Result<Output, ActionError> {
    let output = run_command_with_timeout(command, working_dir, ctx.timeout, ctx.stream_output).await?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(ActionError::ExternalTool {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn create_parent(path: &Path) -> Result<(), FileError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Where each source file lands. A file keeps its name, a directory
/// contributes its contents with their relative paths.
pub fn copy_destinations(sources: &[PathBuf], into: &Path) -> Result<Vec<(PathBuf, PathBuf)>, ActionError> {
    let mut pairs = Vec::new();

    for source in sources {
        if source.is_dir() {
            for file in walk_dir(source)? {
                let relative = file.strip_prefix(source).unwrap_or(&file).to_path_buf();
                pairs.push((file, into.join(relative)));
            }
        } else if source.is_file() {
            let Some(name) = source.file_name() else {
                return Err(ActionError::MissingInput(source.clone()));
            };
            pairs.push((source.clone(), into.join(name)));
        } else {
            return Err(ActionError::MissingInput(source.clone()));
        }
    }

    Ok(pairs)
}

async fn copy_into(sources: &[PathBuf], into: &Path) -> Result<Vec<PathBuf>, ActionError> {
    tokio::fs::create_dir_all(into)
        .await
        .map_err(|e| FileError::io(into, e))?;

    let mut copied = Vec::new();
    for (source, destination) in copy_destinations(sources, into)? {
        create_parent(&destination)?;
        tokio::fs::copy(&source, &destination)
            .await
            .map_err(|e| FileError::io(&source, e))?;
        copied.push(destination);
    }

    Ok(copied)
}

/// The files a task's last execution wrote, for fingerprinting.
pub fn produced_files(task: &TaskDescriptor) -> Result<Vec<PathBuf>, ActionError> {
    match &task.action {
        Action::Copy { sources, into, .. } => Ok(copy_destinations(sources, into)?
            .into_iter()
            .map(|(_, destination)| destination)
            .collect()),
        _ => Ok(expand_paths(&task.outputs)?),
    }
}

fn read_counters(path: &Path) -> Result<CoverageCounters, ActionError> {
    if !path.exists() {
        return Err(ActionError::MissingInput(path.to_path_buf()));
    }
    let contents = fs::read(path).map_err(|e| FileError::io(path, e))?;
    serde_json::from_slice(&contents).map_err(|source| ActionError::Report {
        path: path.to_path_buf(),
        source,
    })
}

pub fn aggregate_coverage(data: &[PathBuf]) -> Result<CoverageCounters, ActionError> {
    data.iter().try_fold(CoverageCounters::default(), |total, path| {
        let counters = read_counters(path)?;
        let overflow = || ActionError::CounterOverflow(path.clone());
        Ok(CoverageCounters {
            covered: total.covered.checked_add(counters.covered).ok_or_else(overflow)?,
            missed: total.missed.checked_add(counters.missed).ok_or_else(overflow)?,
        })
    })
}

/// Aggregates coverage, writes the report, then enforces `minimum`.
fn verify_coverage(data: &[PathBuf], report_path: &Path, minimum: Option<f64>) -> Result<ActionReport, ActionError> {
    let totals = aggregate_coverage(data)?;
    let ratio = totals.ratio();
    let passed = minimum.is_none_or(|minimum| ratio >= minimum);

    let report = CoverageReport {
        covered: totals.covered,
        missed: totals.missed,
        ratio,
        minimum,
        passed,
    };

    create_parent(report_path)?;
    let rendered = serde_json::to_vec_pretty(&report).map_err(|source| ActionError::Report {
        path: report_path.to_path_buf(),
        source,
    })?;
    fs::write(report_path, rendered).map_err(|e| FileError::io(report_path, e))?;
    debug!(
        "Coverage {:.4} ({} covered, {} missed) written to {}",
        ratio,
        totals.covered,
        totals.missed,
        report_path.display()
    );

    match minimum {
        Some(minimum) if !passed => {
            warn!("Coverage {:.4} is below {:.4}", ratio, minimum);
            Err(ActionError::GateThreshold {
                metric: "line coverage".to_string(),
                observed: ratio,
                minimum,
            })
        }
        _ => Ok(ActionReport::default()),
    }
}
