use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{Action, TaskDescriptor, TaskPath, dependency::validate_tasks};
use crate::{
    cache::get_cache_path,
    error::{KeelError, Result},
    output::OutputMode,
};

static BRACED_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
static SIMPLE_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid regex"));

const DEFAULT_OUTPUT_FLAG: &str = "--output";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default, rename = "task")]
    tasks: HashMap<String, RawTask>,
    #[serde(default, rename = "module")]
    modules: HashMap<String, RawModule>,
    config: Option<ConfigSection>,
    #[serde(default)]
    variables: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigSection {
    default: Option<String>,
    cache_dir: Option<String>,
    workers: Option<usize>,
    default_timeout: Option<String>,
    output: Option<OutputMode>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModule {
    dir: Option<String>,
    #[serde(default, rename = "task")]
    tasks: HashMap<String, RawTask>,
    #[serde(default, rename = "wire")]
    wiring: Vec<RawWire>,
}

/// Adds dependency edges onto a task declared elsewhere.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWire {
    task: String,
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    description: Option<String>,
    group: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    must_run_after: Vec<String>,
    #[serde(default)]
    finalized_by: Vec<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    timeout: Option<String>,
    #[serde(default)]
    ignore_failures: bool,

    command: Option<String>,
    working_dir: Option<String>,
    compile: Option<RawCompile>,
    copy: Option<RawCopy>,
    delete: Option<RawDelete>,
    analyze: Option<RawAnalyze>,
    coverage: Option<RawCoverage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCompile {
    compiler: Vec<String>,
    source_dir: String,
    entry: String,
    output: String,
    output_flag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCopy {
    #[serde(default)]
    from: Vec<String>,
    #[serde(default)]
    from_tasks: Vec<String>,
    into: RawInto,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInto {
    Path(String),
    Task { task: String, subdir: Option<String> },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDelete {
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnalyze {
    command: String,
    report: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCoverage {
    data: Vec<String>,
    report: String,
    minimum: Option<f64>,
}

#[derive(Debug)]
pub struct TaskConfiguration {
    pub tasks: Vec<TaskDescriptor>,
    pub root_dir: PathBuf,
    pub default_task: Option<String>,
    pub cache_file: PathBuf,
    pub workers: Option<usize>,
    pub default_timeout: Option<String>,
    pub output: Option<OutputMode>,
}

impl TaskConfiguration {
    pub fn task(&self, path: &TaskPath) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| &t.path == path)
    }
}

pub fn load_tasks(config_path: &Path) -> Result<TaskConfiguration> {
    let contents = fs::read_to_string(config_path).map_err(|e| {
        KeelError::Config(format!("Cannot read '{}': {}", config_path.display(), e))
    })?;

    let root_dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    parse_tasks(&contents, &std::path::absolute(root_dir)?)
}

/// Parses configuration text whose relative paths resolve against `root_dir`.
pub fn parse_tasks(contents: &str, root_dir: &Path) -> Result<TaskConfiguration> {
    let config: Config = toml::from_str(contents)?;
    process_config(config, root_dir)
}

/// A module as seen while resolving: its name, directory and variables.
struct ModuleScope {
    name: Option<String>,
    dir: PathBuf,
    variables: HashMap<String, String>,
}

impl ModuleScope {
    fn substitute(&self, text: &str) -> String {
        substitute_variables(text, &self.variables)
    }

    fn resolve_path(&self, raw: &str) -> PathBuf {
        let substituted = PathBuf::from(self.substitute(raw));
        if substituted.is_absolute() {
            substituted
        } else {
            self.dir.join(substituted)
        }
    }

    fn resolve_paths(&self, raw: &[String]) -> Vec<PathBuf> {
        raw.iter().map(|p| self.resolve_path(p)).collect()
    }
}

/// Copy destinations declared by reference, resolved once every task exists.
struct PendingCopy {
    path: TaskPath,
    from_tasks: Vec<TaskPath>,
    into_task: Option<(TaskPath, Option<String>)>,
    explicit_outputs: bool,
}

fn process_config(config: Config, root_dir: &Path) -> Result<TaskConfiguration> {
    let section = config.config.as_ref();
    let default_task = section.and_then(|c| c.default.clone());
    let workers = section.and_then(|c| c.workers);
    let default_timeout = section.and_then(|c| c.default_timeout.clone());
    let output = section.and_then(|c| c.output);
    let cache_file = get_cache_path(section.and_then(|c| c.cache_dir.as_deref()), root_dir);

    let mut variables = config.variables;
    add_builtin_variables(&mut variables, root_dir);

    let mut scopes = vec![(
        ModuleScope {
            name: None,
            dir: root_dir.to_path_buf(),
            variables: module_variables(&variables, root_dir),
        },
        config.tasks,
        Vec::new(),
    )];

    let mut module_names: Vec<String> = config.modules.keys().cloned().collect();
    module_names.sort();
    let mut modules = config.modules;

    for name in module_names {
        let Some(module) = modules.remove(&name) else {
            continue;
        };
        if name.is_empty() || name.contains(':') {
            return Err(KeelError::Config(format!("Invalid module name '{}'", name)));
        }
        let raw_dir = module.dir.as_deref().unwrap_or(&name);
        let dir = root_dir.join(substitute_variables(raw_dir, &variables));
        scopes.push((
            ModuleScope {
                name: Some(name),
                variables: module_variables(&variables, &dir),
                dir,
            },
            module.tasks,
            module.wiring,
        ));
    }

    let known: Vec<TaskPath> = scopes
        .iter()
        .flat_map(|(scope, tasks, _)| {
            tasks
                .keys()
                .map(|name| TaskPath::new(scope.name.as_deref(), name))
        })
        .collect();

    let mut tasks: Vec<TaskDescriptor> = Vec::new();
    let mut pending_copies: Vec<PendingCopy> = Vec::new();
    let mut wires: Vec<(TaskPath, Vec<TaskPath>)> = Vec::new();

    for (scope, raw_tasks, wiring) in &scopes {
        for (name, raw) in raw_tasks {
            if name.is_empty() || name.contains(':') {
                return Err(KeelError::Config(format!("Invalid task name '{}'", name)));
            }
            let path = TaskPath::new(scope.name.as_deref(), name);
            let (task, pending) = build_task(path, raw, scope, &known)?;
            tasks.push(task);
            pending_copies.extend(pending);
        }

        for wire in wiring {
            let target = resolve_reference(&wire.task, scope, &known)?;
            let depends_on = wire
                .depends_on
                .iter()
                .map(|dep| resolve_reference(dep, scope, &known))
                .collect::<Result<Vec<_>>>()?;
            wires.push((target, depends_on));
        }
    }

    for (target, depends_on) in wires {
        let task = tasks
            .iter_mut()
            .find(|t| t.path == target)
            .ok_or_else(|| KeelError::Config(format!("Wired task '{}' not found", target)))?;
        debug!("Wiring '{}' to depend on {:?}", target, depends_on);
        for dep in depends_on {
            if !task.dependencies.contains(&dep) {
                task.dependencies.push(dep);
            }
        }
    }

    resolve_copies(&mut tasks, pending_copies)?;

    tasks.sort_by(|a, b| a.path.cmp(&b.path));
    validate_tasks(&tasks)?;

    Ok(TaskConfiguration {
        tasks,
        root_dir: root_dir.to_path_buf(),
        default_task,
        cache_file,
        workers,
        default_timeout,
        output,
    })
}

fn build_task(
    path: TaskPath,
    raw: &RawTask,
    scope: &ModuleScope,
    known: &[TaskPath],
) -> Result<(TaskDescriptor, Option<PendingCopy>)> {
    let declared_actions = [
        raw.command.is_some(),
        raw.compile.is_some(),
        raw.copy.is_some(),
        raw.delete.is_some(),
        raw.analyze.is_some(),
        raw.coverage.is_some(),
    ]
    .into_iter()
    .filter(|declared| *declared)
    .count();

    if declared_actions > 1 {
        return Err(KeelError::Config(format!(
            "Task '{}' declares more than one action",
            path
        )));
    }
    if raw.working_dir.is_some() && raw.command.is_none() {
        return Err(KeelError::Config(format!(
            "Task '{}' sets working_dir without a command",
            path
        )));
    }

    let resolve_all = |refs: &[String]| -> Result<Vec<TaskPath>> {
        refs.iter()
            .map(|r| resolve_reference(r, scope, known))
            .collect()
    };

    let mut inputs = scope.resolve_paths(&raw.inputs);
    let mut outputs = scope.resolve_paths(&raw.outputs);
    let mut pending = None;

    let action = if let Some(command) = &raw.command {
        Action::Exec {
            command: scope.substitute(command),
            working_dir: Some(
                raw.working_dir
                    .as_deref()
                    .map_or_else(|| scope.dir.clone(), |d| scope.resolve_path(d)),
            ),
        }
    } else if let Some(compile) = &raw.compile {
        if compile.compiler.is_empty() {
            return Err(KeelError::Config(format!(
                "Task '{}' has an empty compiler command",
                path
            )));
        }
        let source_dir = scope.resolve_path(&compile.source_dir);
        let output = scope.resolve_path(&compile.output);
        if inputs.is_empty() {
            inputs.push(source_dir.clone());
        }
        if outputs.is_empty() {
            outputs.push(output.clone());
        }
        Action::Compile {
            compiler: compile.compiler.iter().map(|c| scope.substitute(c)).collect(),
            entry: scope.resolve_path(&compile.entry),
            source_dir,
            output,
            output_flag: compile
                .output_flag
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_FLAG.to_string()),
        }
    } else if let Some(copy) = &raw.copy {
        let sources = scope.resolve_paths(&copy.from);
        inputs.extend(sources.iter().cloned());

        let (into, into_task) = match &copy.into {
            RawInto::Path(dir) => (scope.resolve_path(dir), None),
            RawInto::Task { task, subdir } => (
                PathBuf::new(),
                Some((resolve_reference(task, scope, known)?, subdir.clone())),
            ),
        };

        pending = Some(PendingCopy {
            path: path.clone(),
            from_tasks: resolve_all(&copy.from_tasks)?,
            into_task,
            explicit_outputs: !outputs.is_empty(),
        });

        Action::Copy {
            sources,
            from_tasks: Vec::new(),
            into,
        }
    } else if let Some(delete) = &raw.delete {
        Action::Delete {
            paths: scope.resolve_paths(&delete.paths),
        }
    } else if let Some(analyze) = &raw.analyze {
        let report = scope.resolve_path(&analyze.report);
        if !outputs.contains(&report) {
            outputs.push(report.clone());
        }
        Action::Analyze {
            command: scope.substitute(&analyze.command),
            report,
            working_dir: scope.dir.clone(),
        }
    } else if let Some(coverage) = &raw.coverage {
        if let Some(minimum) = coverage.minimum {
            if !(0.0..=1.0).contains(&minimum) {
                return Err(KeelError::Config(format!(
                    "Task '{}' has a coverage minimum outside 0..=1: {}",
                    path, minimum
                )));
            }
        }
        let data = scope.resolve_paths(&coverage.data);
        let report = scope.resolve_path(&coverage.report);
        for file in &data {
            if !inputs.contains(file) {
                inputs.push(file.clone());
            }
        }
        if !outputs.contains(&report) {
            outputs.push(report.clone());
        }
        Action::Coverage {
            data,
            report,
            minimum: coverage.minimum,
        }
    } else {
        Action::Lifecycle
    };

    let task = TaskDescriptor {
        description: raw.description.clone(),
        group: raw.group.clone(),
        inputs,
        outputs,
        dependencies: resolve_all(&raw.dependencies)?,
        must_run_after: resolve_all(&raw.must_run_after)?,
        finalized_by: resolve_all(&raw.finalized_by)?,
        timeout: raw.timeout.clone(),
        ignore_failures: raw.ignore_failures,
        action,
        path,
    };

    Ok((task, pending))
}

/// Fills in copy destinations given by task reference and the sources that
/// come from other tasks' outputs.
fn resolve_copies(tasks: &mut [TaskDescriptor], pending: Vec<PendingCopy>) -> Result<()> {
    for copy in &pending {
        let Some((into_task, subdir)) = &copy.into_task else {
            continue;
        };

        let base = tasks
            .iter()
            .find(|t| &t.path == into_task)
            .and_then(|t| match &t.action {
                Action::Copy { into, .. } if !into.as_os_str().is_empty() => Some(into.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                KeelError::Config(format!(
                    "Task '{}' copies into '{}', which is not a copy task with a directory destination",
                    copy.path, into_task
                ))
            })?;

        let destination = match subdir {
            Some(subdir) => base.join(subdir),
            None => base,
        };
        set_copy_destination(tasks, &copy.path, destination);
    }

    for copy in &pending {
        if !copy.explicit_outputs {
            if let Some(task) = tasks.iter_mut().find(|t| t.path == copy.path) {
                if let Action::Copy { into, .. } = &task.action {
                    task.outputs = vec![into.clone()];
                }
            }
        }
    }

    for copy in pending {
        let mut extra_sources = Vec::new();
        for source_task in &copy.from_tasks {
            let producer = tasks
                .iter()
                .find(|t| &t.path == source_task)
                .ok_or_else(|| KeelError::Config(format!("Task '{}' not found", source_task)))?;
            if producer.outputs.is_empty() {
                return Err(KeelError::Config(format!(
                    "Task '{}' copies from '{}', which declares no outputs",
                    copy.path, source_task
                )));
            }
            extra_sources.extend(producer.outputs.iter().cloned());
        }

        if let Some(task) = tasks.iter_mut().find(|t| t.path == copy.path) {
            for source in &extra_sources {
                if !task.inputs.contains(source) {
                    task.inputs.push(source.clone());
                }
            }
            if let Action::Copy {
                sources,
                from_tasks,
                ..
            } = &mut task.action
            {
                sources.extend(extra_sources);
                *from_tasks = copy.from_tasks;
            }
        }
    }

    Ok(())
}

fn set_copy_destination(tasks: &mut [TaskDescriptor], path: &TaskPath, destination: PathBuf) {
    if let Some(task) = tasks.iter_mut().find(|t| &t.path == path) {
        if let Action::Copy { into, .. } = &mut task.action {
            *into = destination;
        }
    }
}

/// `:module:task` is absolute. A bare name resolves in the declaring module
/// first, then in the root module.
fn resolve_reference(raw: &str, scope: &ModuleScope, known: &[TaskPath]) -> Result<TaskPath> {
    let candidates = if raw.starts_with(':') {
        let path = TaskPath::parse(raw)
            .ok_or_else(|| KeelError::Config(format!("Malformed task path '{}'", raw)))?;
        vec![path]
    } else {
        vec![
            TaskPath::new(scope.name.as_deref(), raw),
            TaskPath::new(None, raw),
        ]
    };

    candidates
        .into_iter()
        .find(|candidate| known.contains(candidate))
        .ok_or_else(|| KeelError::Dependency(format!("Task '{}' doesn't exist", raw)))
}

fn add_builtin_variables(variables: &mut HashMap<String, String>, root_dir: &Path) {
    for (key, value) in env::vars() {
        variables.insert(format!("ENV_{}", key), value);
    }

    if let Ok(pwd) = env::current_dir() {
        variables.insert("PWD".to_string(), pwd.to_string_lossy().to_string());
    }

    variables.insert(
        "ROOT_DIR".to_string(),
        root_dir.to_string_lossy().to_string(),
    );
}

fn module_variables(global: &HashMap<String, String>, module_dir: &Path) -> HashMap<String, String> {
    let mut variables = global.clone();
    variables.insert(
        "PROJECT_DIR".to_string(),
        module_dir.to_string_lossy().to_string(),
    );
    variables.insert(
        "BUILD_DIR".to_string(),
        module_dir.join("build").to_string_lossy().to_string(),
    );
    variables
}

fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let braced = replace_variables(&BRACED_VARIABLE, text, variables);
    replace_variables(&SIMPLE_VARIABLE, &braced, variables)
}

fn replace_variables(pattern: &Regex, text: &str, variables: &HashMap<String, String>) -> String {
    pattern
        .replace_all(text, |caps: &regex::Captures| {
            let var_name = &caps[1];
            variables
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
