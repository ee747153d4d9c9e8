pub mod analysis;
pub mod config;
pub mod dependency;

pub use analysis::show_task_relationships;
pub use config::{TaskConfiguration, load_tasks};
pub use dependency::{ExecutionPlan, plan_execution, resolve_targets, sort_topologically};

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Identity of a task: `:module:name`, or `:name` for the root module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPath(String);

impl TaskPath {
    pub fn new(module: Option<&str>, name: &str) -> Self {
        match module {
            Some(module) => TaskPath(format!(":{}:{}", module, name)),
            None => TaskPath(format!(":{}", name)),
        }
    }

    /// Parses an absolute path. Bare names are not paths.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(':')?;
        let valid = match rest.split_once(':') {
            Some((module, name)) => {
                !module.is_empty() && !name.is_empty() && !name.contains(':')
            }
            None => !rest.is_empty(),
        };
        valid.then(|| TaskPath(raw.to_string()))
    }

    pub fn module(&self) -> Option<&str> {
        self.0[1..].split_once(':').map(|(module, _)| module)
    }

    pub fn name(&self) -> &str {
        match self.0[1..].split_once(':') {
            Some((_, name)) => name,
            None => &self.0[1..],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for TaskPath {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TaskPath {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// The work a task performs once the scheduler decides it must run.
///
/// Actions carry fully resolved paths so the scheduler can hash and compare
/// them without looking at the configuration again.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Action {
    /// Groups dependencies, does no work of its own.
    Lifecycle,
    Exec {
        command: String,
        working_dir: Option<PathBuf>,
    },
    /// Runs `compiler... <entry> <output_flag> <output>` inside `source_dir`.
    Compile {
        compiler: Vec<String>,
        source_dir: PathBuf,
        entry: PathBuf,
        output: PathBuf,
        output_flag: String,
    },
    /// Copies `sources` into `into`, keeping file names. `from_tasks` records
    /// which producing tasks contributed sources.
    Copy {
        sources: Vec<PathBuf>,
        from_tasks: Vec<TaskPath>,
        into: PathBuf,
    },
    Delete {
        paths: Vec<PathBuf>,
    },
    /// Runs an analyzer in `working_dir` that is expected to write `report`.
    Analyze {
        command: String,
        report: PathBuf,
        working_dir: PathBuf,
    },
    Coverage {
        data: Vec<PathBuf>,
        report: PathBuf,
        minimum: Option<f64>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Lifecycle => "lifecycle",
            Action::Exec { .. } => "exec",
            Action::Compile { .. } => "compile",
            Action::Copy { .. } => "copy",
            Action::Delete { .. } => "delete",
            Action::Analyze { .. } => "analyze",
            Action::Coverage { .. } => "coverage",
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Action::Lifecycle)
    }

    /// Human-readable summary used by `--dry-run`.
    pub fn describe(&self) -> String {
        match self {
            Action::Lifecycle => "(lifecycle)".to_string(),
            Action::Exec { command, .. } | Action::Analyze { command, .. } => command.clone(),
            Action::Compile {
                compiler,
                entry,
                output,
                output_flag,
                ..
            } => format!(
                "{} {} {} {}",
                compiler.join(" "),
                entry.display(),
                output_flag,
                output.display()
            ),
            Action::Copy { sources, into, .. } => {
                format!("copy {} path(s) into {}", sources.len(), into.display())
            }
            Action::Delete { paths } => format!("delete {} path(s)", paths.len()),
            Action::Coverage {
                data,
                minimum: Some(minimum),
                ..
            } => format!("verify coverage of {} file(s) >= {}", data.len(), minimum),
            Action::Coverage { data, .. } => format!("aggregate coverage of {} file(s)", data.len()),
        }
    }
}

/// Immutable description of one task node.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub path: TaskPath,
    pub description: Option<String>,
    pub group: Option<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub dependencies: Vec<TaskPath>,
    /// Ordering only, and only when both tasks are scheduled.
    pub must_run_after: Vec<TaskPath>,
    /// Tasks that run after this one whenever it is scheduled, without
    /// becoming part of the requested target's dependency path.
    pub finalized_by: Vec<TaskPath>,
    pub timeout: Option<String>,
    pub ignore_failures: bool,
    pub action: Action,
}

impl TaskDescriptor {
    pub fn new(path: TaskPath, action: Action) -> Self {
        Self {
            path,
            description: None,
            group: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            must_run_after: Vec::new(),
            finalized_by: Vec::new(),
            timeout: None,
            ignore_failures: false,
            action,
        }
    }
}
