use std::{
    collections::{HashMap, HashSet},
    fmt,
    io::Write,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    action::{ActionContext, ActionReport, produced_files, run_action},
    cache::{Cache, Fingerprint},
    error::ActionError,
    output::OutputMode,
    task::{ExecutionPlan, TaskDescriptor, TaskPath},
    util::{hash_files, is_glob_pattern, parse_timeout},
};

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    NotEvaluated,
    Skipped,
    /// Holds a worker permit; its up-to-date check or action is running.
    Executing,
    Succeeded,
    Failed(String),
    /// A dependency failed or was blocked, so the task never started.
    Blocked,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::NotEvaluated | TaskState::Executing)
    }

    /// Terminal and usable by dependents.
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskState::Skipped | TaskState::Succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub path: TaskPath,
    pub state: TaskState,
    /// Reached through dependency edges from a requested target.
    pub wired: bool,
    pub warnings: Vec<String>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    /// Terminal tasks in the order they finished, then anything never
    /// evaluated in plan order.
    pub tasks: Vec<TaskReport>,
    pub cache_changed: bool,
}

impl BuildReport {
    /// A build fails only through tasks on a target's dependency path.
    pub fn success(&self) -> bool {
        !self
            .tasks
            .iter()
            .any(|t| t.wired && matches!(t.state, TaskState::Failed(_)))
    }

    pub fn task(&self, path: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.path == path)
    }

    pub fn state(&self, path: &str) -> Option<&TaskState> {
        self.task(path).map(|t| &t.state)
    }

    /// Tasks whose action actually ran.
    pub fn executed(&self) -> Vec<&TaskPath> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Succeeded | TaskState::Failed(_)))
            .filter(|t| t.duration.is_some())
            .map(|t| &t.path)
            .collect()
    }

    pub fn failed(&self) -> Vec<&TaskReport> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Failed(_)))
            .collect()
    }
}

/// Why the up-to-date check decided a task must execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    NoOutputs,
    OutputsMissing,
    NoHistory,
    ActionChanged,
    InputsChanged,
    OutputsChanged,
    Unfingerprintable(String),
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::NoOutputs => write!(f, "no declared outputs, always run"),
            RunReason::OutputsMissing => write!(f, "outputs missing, must run"),
            RunReason::NoHistory => write!(f, "no previous execution recorded"),
            RunReason::ActionChanged => write!(f, "action changed, must run"),
            RunReason::InputsChanged => write!(f, "input content changed, must run"),
            RunReason::OutputsChanged => write!(f, "outputs modified since last run"),
            RunReason::Unfingerprintable(e) => write!(f, "could not fingerprint: {}", e),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workers: Option<usize>,
    pub default_timeout: Option<String>,
    pub continue_on_failure: bool,
    pub output_mode: OutputMode,
}

/// What a worker reports once it has held a permit.
enum Outcome {
    UpToDate,
    Ran {
        result: Result<ActionReport, ActionError>,
        /// Post-execution fingerprint. `None` when nothing should be recorded.
        fingerprint: Result<Option<Fingerprint>, String>,
        duration: Duration,
    },
}

type Completion = (TaskPath, Outcome);

pub struct TaskRunner<'a> {
    tasks: &'a [TaskDescriptor],
    cache: &'a mut Cache,
    default_timeout: Option<String>,
    workers: usize,
    continue_on_failure: bool,
    output_mode: OutputMode,
}

impl<'a> TaskRunner<'a> {
    pub fn new(tasks: &'a [TaskDescriptor], cache: &'a mut Cache, options: RunOptions) -> Self {
        let workers = options.workers.unwrap_or_else(default_workers).max(1);
        Self {
            tasks,
            cache,
            default_timeout: options.default_timeout,
            workers,
            continue_on_failure: options.continue_on_failure,
            output_mode: options.output_mode,
        }
    }

    pub async fn run_plan(&mut self, plan: &ExecutionPlan) -> BuildReport {
        let tasks = self.tasks;
        let task_map: HashMap<&TaskPath, &TaskDescriptor> =
            tasks.iter().map(|t| (&t.path, t)).collect();
        let scheduled: HashSet<&TaskPath> = plan.order.iter().collect();

        let mut finalizes: HashMap<&TaskPath, Vec<&TaskPath>> = HashMap::new();
        for path in &plan.order {
            if let Some(task) = task_map.get(path) {
                for finalizer in task.finalized_by.iter().filter(|f| scheduled.contains(f)) {
                    finalizes.entry(finalizer).or_default().push(path);
                }
            }
        }

        let mut states: HashMap<TaskPath, TaskState> = plan
            .order
            .iter()
            .map(|p| (p.clone(), TaskState::NotEvaluated))
            .collect();

        let mut report = BuildReport::default();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set: JoinSet<Completion> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TaskPath> = HashMap::new();
        let mut aborted = false;

        debug!(
            "Scheduling {} task(s) with up to {} workers",
            plan.order.len(),
            self.workers
        );

        loop {
            if !aborted {
                // Plan order is topological, so one pass sees every task whose
                // predecessors were resolved earlier in the same pass.
                for path in &plan.order {
                    if states.get(path) != Some(&TaskState::NotEvaluated) {
                        continue;
                    }
                    let Some(&task) = task_map.get(path) else {
                        continue;
                    };

                    let hard: Vec<&TaskPath> = task
                        .dependencies
                        .iter()
                        .filter(|d| scheduled.contains(d))
                        .collect();
                    let soft = task
                        .must_run_after
                        .iter()
                        .filter(|d| scheduled.contains(d))
                        .chain(finalizes.get(path).into_iter().flatten().copied());

                    let waiting = hard
                        .iter()
                        .copied()
                        .chain(soft)
                        .any(|p| !states.get(p).is_some_and(TaskState::is_terminal));
                    if waiting {
                        continue;
                    }

                    if hard.iter().any(|p| !states.get(*p).is_some_and(TaskState::is_ok)) {
                        debug!("Task '{}': dependency did not succeed, blocked", path);
                        self.finish(&mut states, &mut report, plan, path, TaskState::Blocked, Vec::new(), None);
                        continue;
                    }

                    if task.action.is_lifecycle() {
                        let all_skipped = hard
                            .iter()
                            .all(|p| states.get(*p) == Some(&TaskState::Skipped));
                        let state = if all_skipped {
                            TaskState::Skipped
                        } else {
                            TaskState::Succeeded
                        };
                        self.finish(&mut states, &mut report, plan, path, state, Vec::new(), None);
                        continue;
                    }

                    // A task is only spawned once it holds a permit, so an
                    // abort leaves everything without one NOT_EVALUATED.
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        continue;
                    };

                    let ctx = ActionContext {
                        timeout: parse_timeout(task.timeout.as_deref(), self.default_timeout.as_deref()),
                        stream_output: self.output_mode.streams(),
                    };
                    let recorded = self.cache.get(path).cloned();
                    let handle = join_set.spawn(evaluate(Arc::new(task.clone()), recorded, ctx, permit));

                    running.insert(handle.id(), path.clone());
                    states.insert(path.clone(), TaskState::Executing);
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let (path, outcome) = match joined {
                Ok(completion) => completion,
                Err(join_error) => {
                    let Some(path) = running.remove(&join_error.id()) else {
                        warn!("Lost track of a panicked task: {}", join_error);
                        continue;
                    };
                    eprintln!("Task '{}' panicked: {}", path, join_error);
                    let fatal = plan.is_wired(&path);
                    self.finish(
                        &mut states,
                        &mut report,
                        plan,
                        &path,
                        TaskState::Failed(format!("panicked: {}", join_error)),
                        Vec::new(),
                        None,
                    );
                    aborted |= fatal && !self.continue_on_failure;
                    continue;
                }
            };
            running.retain(|_, p| *p != path);

            let Some(&task) = task_map.get(&path) else {
                continue;
            };

            let (result, fingerprint, duration) = match outcome {
                Outcome::UpToDate => {
                    self.finish(&mut states, &mut report, plan, &path, TaskState::Skipped, Vec::new(), None);
                    continue;
                }
                Outcome::Ran {
                    result,
                    fingerprint,
                    duration,
                } => (result, fingerprint, duration),
            };

            match result {
                Ok(action_report) => {
                    self.replay_output(&action_report);
                    for warning in &action_report.warnings {
                        warn!("Task '{}': {}", path, warning);
                    }
                    report.cache_changed |= self.store_fingerprint(&path, fingerprint);
                    self.finish(
                        &mut states,
                        &mut report,
                        plan,
                        &path,
                        TaskState::Succeeded,
                        action_report.warnings,
                        Some(duration),
                    );
                }
                Err(error) if task.ignore_failures && error.is_gate_failure() => {
                    let warning = format!("failure ignored: {}", error);
                    warn!("Task '{}': {}", path, warning);
                    report.cache_changed |= self.store_fingerprint(&path, fingerprint);
                    self.finish(
                        &mut states,
                        &mut report,
                        plan,
                        &path,
                        TaskState::Succeeded,
                        vec![warning],
                        Some(duration),
                    );
                }
                Err(error) => {
                    report.cache_changed |= self.cache.remove(&path).is_some();
                    let wired = plan.is_wired(&path);
                    self.finish(
                        &mut states,
                        &mut report,
                        plan,
                        &path,
                        TaskState::Failed(error.to_string()),
                        Vec::new(),
                        Some(duration),
                    );
                    eprintln!("Error: Task '{}' failed: {}", path, error);

                    if !wired {
                        info!("Task '{}' is not on a target's dependency path, continuing", path);
                    } else if self.continue_on_failure {
                        eprintln!("Continuing with independent tasks due to --continue-on-failure");
                    } else if !aborted {
                        eprintln!("Stopping execution, waiting for running tasks to finish");
                        aborted = true;
                    }
                }
            }
        }

        for path in &plan.order {
            if states.get(path) == Some(&TaskState::NotEvaluated) {
                report.tasks.push(TaskReport {
                    path: path.clone(),
                    state: TaskState::NotEvaluated,
                    wired: plan.is_wired(path),
                    warnings: Vec::new(),
                    duration: None,
                });
            }
        }

        report
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        states: &mut HashMap<TaskPath, TaskState>,
        report: &mut BuildReport,
        plan: &ExecutionPlan,
        path: &TaskPath,
        state: TaskState,
        warnings: Vec<String>,
        duration: Option<Duration>,
    ) {
        match &state {
            TaskState::Skipped => println!("> Task {} UP-TO-DATE", path),
            TaskState::Succeeded => println!("> Task {}", path),
            TaskState::Failed(_) => println!("> Task {} FAILED", path),
            _ => {}
        }

        states.insert(path.clone(), state.clone());
        report.tasks.push(TaskReport {
            path: path.clone(),
            state,
            wired: plan.is_wired(path),
            warnings,
            duration,
        });
    }

    fn replay_output(&self, action_report: &ActionReport) {
        if !self.output_mode.replays() {
            return;
        }
        if !action_report.stdout.is_empty() {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(&action_report.stdout);
            let _ = out.flush();
        }
        if !action_report.stderr.is_empty() {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(&action_report.stderr);
            let _ = err.flush();
        }
    }

    /// Returns whether the cache changed.
    fn store_fingerprint(
        &mut self,
        path: &TaskPath,
        fingerprint: Result<Option<Fingerprint>, String>,
    ) -> bool {
        match fingerprint {
            Ok(Some(fingerprint)) => {
                debug!("Task '{}': recorded fingerprint", path);
                self.cache.insert(path.clone(), fingerprint.clone()) != Some(fingerprint)
            }
            Ok(None) => self.cache.remove(path).is_some(),
            Err(e) => {
                warn!("Could not fingerprint outputs of '{}': {}", path, e);
                self.cache.remove(path).is_some()
            }
        }
    }
}

/// Runs under a worker permit: the up-to-date check, the action, then the
/// new fingerprint. Hashing happens on the blocking pool.
async fn evaluate(
    task: Arc<TaskDescriptor>,
    recorded: Option<Fingerprint>,
    ctx: ActionContext,
    _permit: OwnedSemaphorePermit,
) -> Completion {
    let path = task.path.clone();

    let checked = Arc::clone(&task);
    let reason = tokio::task::spawn_blocking(move || check_up_to_date(&checked, recorded.as_ref()))
        .await
        .unwrap_or_else(|e| Some(RunReason::Unfingerprintable(e.to_string())));
    let Some(reason) = reason else {
        debug!("Task '{}': outputs up-to-date, skipping", path);
        return (path, Outcome::UpToDate);
    };
    debug!("Task '{}': {}", path, reason);

    let started = Instant::now();
    let result = run_action(&task, ctx).await;
    let duration = started.elapsed();

    let keeps_fingerprint = match &result {
        Ok(_) => true,
        Err(error) => task.ignore_failures && error.is_gate_failure(),
    };
    let fingerprint = if keeps_fingerprint {
        let produced = Arc::clone(&task);
        tokio::task::spawn_blocking(move || compute_fingerprint(&produced))
            .await
            .unwrap_or_else(|e| Err(e.to_string()))
    } else {
        Ok(None)
    };

    (
        path,
        Outcome::Ran {
            result,
            fingerprint,
            duration,
        },
    )
}

/// Returns `None` when the task is up to date, otherwise why it must run.
fn check_up_to_date(task: &TaskDescriptor, recorded: Option<&Fingerprint>) -> Option<RunReason> {
    if task.outputs.is_empty() {
        return Some(RunReason::NoOutputs);
    }

    let outputs_exist = task
        .outputs
        .iter()
        .filter(|o| !is_glob_pattern(&o.to_string_lossy()))
        .all(|o| o.exists());
    if !outputs_exist {
        return Some(RunReason::OutputsMissing);
    }

    let Some(recorded) = recorded else {
        return Some(RunReason::NoHistory);
    };

    let (action, inputs) = match fingerprint_inputs(task) {
        Ok(parts) => parts,
        Err(e) => return Some(RunReason::Unfingerprintable(e)),
    };

    if recorded.action != action {
        return Some(RunReason::ActionChanged);
    }
    if recorded.inputs != inputs {
        return Some(RunReason::InputsChanged);
    }

    if recorded.produced.iter().any(|p| !p.exists()) {
        return Some(RunReason::OutputsMissing);
    }
    match hash_files(&recorded.produced) {
        Ok(hash) if hash.to_hex().as_str() == recorded.outputs => None,
        Ok(_) => Some(RunReason::OutputsChanged),
        Err(e) => Some(RunReason::Unfingerprintable(e.to_string())),
    }
}

/// The fingerprint after a run. Tasks without outputs are never recorded.
fn compute_fingerprint(task: &TaskDescriptor) -> Result<Option<Fingerprint>, String> {
    if task.outputs.is_empty() {
        return Ok(None);
    }

    let (action, inputs) = fingerprint_inputs(task)?;
    let produced = produced_files(task).map_err(|e| e.to_string())?;
    let outputs = hash_files(&produced).map_err(|e| e.to_string())?;
    Ok(Some(Fingerprint {
        action,
        inputs,
        outputs: outputs.to_hex().to_string(),
        produced,
    }))
}

fn fingerprint_inputs(task: &TaskDescriptor) -> Result<(String, String), String> {
    let action = serde_json::to_vec(&task.action).map_err(|e| e.to_string())?;
    let inputs = hash_files(&task.inputs).map_err(|e| e.to_string())?;
    Ok((
        blake3::hash(&action).to_hex().to_string(),
        inputs.to_hex().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use super::*;
    use crate::task::{Action, plan_execution};

    fn exec(dir: &Path, path: &str, command: &str) -> TaskDescriptor {
        TaskDescriptor::new(
            TaskPath::parse(path).unwrap(),
            Action::Exec {
                command: command.to_string(),
                working_dir: Some(dir.to_path_buf()),
            },
        )
    }

    async fn run(tasks: &[TaskDescriptor], cache: &mut Cache, targets: &[&str]) -> BuildReport {
        let targets: Vec<TaskPath> = targets.iter().map(|t| TaskPath::parse(t).unwrap()).collect();
        let plan = plan_execution(tasks, &targets).unwrap();
        let options = RunOptions {
            workers: Some(2),
            output_mode: OutputMode::Quiet,
            ..RunOptions::default()
        };
        TaskRunner::new(tasks, cache, options).run_plan(&plan).await
    }

    #[tokio::test]
    async fn modified_output_forces_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut jar = exec(dir.path(), ":backend:bootJar", "echo packaged > app.jar");
        jar.outputs = vec![dir.path().join("app.jar")];
        let tasks = vec![jar];
        let mut cache = Cache::new();

        let first = run(&tasks, &mut cache, &[":backend:bootJar"]).await;
        assert_eq!(first.state(":backend:bootJar"), Some(&TaskState::Succeeded));
        assert!(first.cache_changed);

        let second = run(&tasks, &mut cache, &[":backend:bootJar"]).await;
        assert_eq!(second.state(":backend:bootJar"), Some(&TaskState::Skipped));

        fs::write(dir.path().join("app.jar"), "tampered").unwrap();
        let third = run(&tasks, &mut cache, &[":backend:bootJar"]).await;
        assert_eq!(third.state(":backend:bootJar"), Some(&TaskState::Succeeded));
        assert_eq!(
            fs::read_to_string(dir.path().join("app.jar")).unwrap(),
            "packaged\n"
        );
    }

    #[tokio::test]
    async fn report_only_gate_succeeds_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("coverage/test.json");
        fs::create_dir_all(data.parent().unwrap()).unwrap();
        fs::write(&data, r#"{"covered":50,"missed":50}"#).unwrap();

        let mut gate = TaskDescriptor::new(
            TaskPath::parse(":backend:coverageVerify").unwrap(),
            Action::Coverage {
                data: vec![data.clone()],
                report: dir.path().join("reports/coverage.json"),
                minimum: Some(0.9),
            },
        );
        gate.inputs = vec![data];
        gate.outputs = vec![dir.path().join("reports/coverage.json")];
        gate.ignore_failures = true;

        let mut cache = Cache::new();
        let report = run(&[gate], &mut cache, &[":backend:coverageVerify"]).await;

        assert!(report.success());
        let task = report.task(":backend:coverageVerify").unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.warnings.len(), 1);
        assert!(task.warnings[0].contains("below the minimum"));
    }

    #[tokio::test]
    async fn must_run_after_only_orders_scheduled_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let test = exec(dir.path(), ":backend:test", "echo test >> order.log");
        let mut pmd = exec(dir.path(), ":backend:pmdMain", "echo pmd >> order.log");
        pmd.must_run_after = vec![test.path.clone()];
        let mut check = TaskDescriptor::new(TaskPath::parse(":check").unwrap(), Action::Lifecycle);
        check.dependencies = vec![test.path.clone(), pmd.path.clone()];
        let tasks = vec![check, test, pmd];
        let mut cache = Cache::new();

        let alone = run(&tasks, &mut cache, &[":backend:pmdMain"]).await;
        assert!(alone.task(":backend:test").is_none());
        fs::remove_file(dir.path().join("order.log")).unwrap();

        let both = run(&tasks, &mut cache, &[":check"]).await;
        assert!(both.success());
        assert_eq!(
            fs::read_to_string(dir.path().join("order.log")).unwrap(),
            "test\npmd\n"
        );
        assert_eq!(both.state(":check"), Some(&TaskState::Succeeded));
    }

    #[tokio::test]
    async fn timeout_fails_task_and_blocks_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let mut slow = exec(dir.path(), ":frontend:elmMake", "sleep 5");
        slow.timeout = Some("100ms".to_string());
        let mut stage = exec(dir.path(), ":frontend:copyElmApp", "true");
        stage.dependencies = vec![slow.path.clone()];
        let tasks = vec![slow, stage];
        let mut cache = Cache::new();

        let targets = vec![TaskPath::parse(":frontend:copyElmApp").unwrap()];
        let plan = plan_execution(&tasks, &targets).unwrap();
        let options = RunOptions {
            continue_on_failure: true,
            output_mode: OutputMode::Quiet,
            ..RunOptions::default()
        };
        let report = TaskRunner::new(&tasks, &mut cache, options).run_plan(&plan).await;

        assert!(!report.success());
        assert!(matches!(
            report.state(":frontend:elmMake"),
            Some(TaskState::Failed(reason)) if reason.contains("timed out")
        ));
        assert_eq!(report.state(":frontend:copyElmApp"), Some(&TaskState::Blocked));
    }

    #[tokio::test]
    async fn fatal_failure_stops_tasks_waiting_for_a_worker() {
        let dir = tempfile::tempdir().unwrap();
        let failing = exec(dir.path(), ":a", "sleep 0.2; exit 1");
        let queued = exec(dir.path(), ":b", "touch ran_b");
        let mut check = TaskDescriptor::new(TaskPath::parse(":check").unwrap(), Action::Lifecycle);
        check.dependencies = vec![failing.path.clone(), queued.path.clone()];
        let tasks = vec![check, failing, queued];
        let mut cache = Cache::new();

        let targets = vec![TaskPath::parse(":check").unwrap()];
        let plan = plan_execution(&tasks, &targets).unwrap();
        let options = RunOptions {
            workers: Some(1),
            output_mode: OutputMode::Quiet,
            ..RunOptions::default()
        };
        let report = TaskRunner::new(&tasks, &mut cache, options).run_plan(&plan).await;

        assert!(!report.success());
        assert!(matches!(report.state(":a"), Some(TaskState::Failed(_))));
        assert_eq!(report.state(":b"), Some(&TaskState::NotEvaluated));
        assert_eq!(report.state(":check"), Some(&TaskState::NotEvaluated));
        assert!(!dir.path().join("ran_b").exists());
    }

    fn failing_analyzer(dir: &Path, ignore_failures: bool) -> Vec<TaskDescriptor> {
        let report = dir.join("build/reports/spotbugs/main.xml");
        let mut spotbugs = TaskDescriptor::new(
            TaskPath::parse(":backend:spotbugsMain").unwrap(),
            Action::Analyze {
                command: "echo '<bug/>' > build/reports/spotbugs/main.xml; exit 1".to_string(),
                report: report.clone(),
                working_dir: dir.to_path_buf(),
            },
        );
        spotbugs.outputs = vec![report];
        spotbugs.ignore_failures = ignore_failures;

        let mut check = TaskDescriptor::new(TaskPath::parse(":check").unwrap(), Action::Lifecycle);
        check.dependencies = vec![spotbugs.path.clone()];
        vec![check, spotbugs]
    }

    #[tokio::test]
    async fn wired_analyzer_failure_fails_check() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = failing_analyzer(dir.path(), false);
        let mut cache = Cache::new();

        let report = run(&tasks, &mut cache, &[":check"]).await;

        assert!(!report.success());
        assert!(matches!(
            report.state(":backend:spotbugsMain"),
            Some(TaskState::Failed(reason)) if reason.contains("exited with")
        ));
        assert_ne!(report.state(":check"), Some(&TaskState::Succeeded));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn report_only_analyzer_records_warning_and_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = failing_analyzer(dir.path(), true);
        let mut cache = Cache::new();

        let report = run(&tasks, &mut cache, &[":check"]).await;

        assert!(report.success());
        let analyzer = report.task(":backend:spotbugsMain").unwrap();
        assert_eq!(analyzer.state, TaskState::Succeeded);
        assert_eq!(analyzer.warnings.len(), 1);
        assert!(analyzer.warnings[0].starts_with("failure ignored"));
        assert_eq!(report.state(":check"), Some(&TaskState::Succeeded));
        assert!(cache.contains_key(&TaskPath::parse(":backend:spotbugsMain").unwrap()));
        assert!(dir.path().join("build/reports/spotbugs/main.xml").is_file());
    }
}
