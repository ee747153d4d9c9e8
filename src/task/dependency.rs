use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    path::PathBuf,
};

use tracing::debug;

use super::{TaskDescriptor, TaskPath};
use crate::error::{KeelError, Result};

/// The tasks one invocation will evaluate.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Every scheduled task in a valid execution order.
    pub order: Vec<TaskPath>,
    /// Scheduled tasks reached through dependency edges from a requested
    /// target. A failure here fails the build.
    pub wired: HashSet<TaskPath>,
}

impl ExecutionPlan {
    pub fn is_wired(&self, path: &TaskPath) -> bool {
        self.wired.contains(path)
    }
}

/// Every edge that constrains order: hard dependencies, `must_run_after`,
/// and finalizers waiting on the task they finalize.
fn ordering_predecessors<'a>(
    task: &'a TaskDescriptor,
    finalizes: &HashMap<&'a TaskPath, Vec<&'a TaskPath>>,
) -> Vec<&'a TaskPath> {
    let mut preds: Vec<&TaskPath> = task
        .dependencies
        .iter()
        .chain(task.must_run_after.iter())
        .collect();
    if let Some(finalized) = finalizes.get(&task.path) {
        preds.extend(finalized.iter().copied());
    }
    preds
}

fn finalizer_index(tasks: &[TaskDescriptor]) -> HashMap<&TaskPath, Vec<&TaskPath>> {
    let mut finalizes: HashMap<&TaskPath, Vec<&TaskPath>> = HashMap::new();
    for task in tasks {
        for finalizer in &task.finalized_by {
            finalizes.entry(finalizer).or_default().push(&task.path);
        }
    }
    finalizes
}

/// Orders `tasks` so every task follows its predecessors. Edges leaving the
/// given set are ignored. Ties are broken by path for stable output.
pub fn sort_topologically(tasks: &[TaskDescriptor]) -> Vec<TaskPath> {
    let present: HashSet<&TaskPath> = tasks.iter().map(|t| &t.path).collect();
    let finalizes = finalizer_index(tasks);

    let mut in_degrees: HashMap<&TaskPath, usize> = HashMap::new();
    let mut successors: HashMap<&TaskPath, Vec<&TaskPath>> = HashMap::new();

    for task in tasks {
        let preds: BTreeSet<&TaskPath> = ordering_predecessors(task, &finalizes)
            .into_iter()
            .filter(|pred| present.contains(pred))
            .collect();
        in_degrees.insert(&task.path, preds.len());
        for pred in preds {
            successors.entry(pred).or_default().push(&task.path);
        }
    }

    let mut ready: BTreeSet<&TaskPath> = in_degrees
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(path, _)| *path)
        .collect();

    let mut sorted_tasks: Vec<TaskPath> = Vec::new();

    while let Some(path) = ready.pop_first() {
        sorted_tasks.push(path.clone());

        for &dependent in successors.get(path).into_iter().flatten() {
            if let Some(degree) = in_degrees.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    sorted_tasks
}

pub fn validate_tasks(tasks: &[TaskDescriptor]) -> Result<()> {
    let task_ids: HashSet<&TaskPath> = tasks.iter().map(|t| &t.path).collect();

    if task_ids.len() != tasks.len() {
        let mut seen = HashSet::new();
        if let Some(duplicate) = tasks.iter().find(|t| !seen.insert(&t.path)) {
            return Err(KeelError::Dependency(format!(
                "Task '{}' is declared more than once",
                duplicate.path
            )));
        }
    }

    for task in tasks {
        let references = [
            ("depends on", &task.dependencies),
            ("must run after", &task.must_run_after),
            ("is finalized by", &task.finalized_by),
        ];

        for (relation, targets) in references {
            for target in targets {
                if target == &task.path {
                    return Err(KeelError::Dependency(format!(
                        "Task '{}' {} itself",
                        task.path, relation
                    )));
                }
                if !task_ids.contains(target) {
                    return Err(KeelError::Dependency(format!(
                        "Task '{}' {} '{}' which doesn't exist",
                        task.path, relation, target
                    )));
                }
            }
        }
    }

    detect_output_conflicts(tasks)?;
    detect_cycles(tasks)?;
    Ok(())
}

/// Each output path may have exactly one producing task.
fn detect_output_conflicts(tasks: &[TaskDescriptor]) -> Result<()> {
    let mut producers: HashMap<&PathBuf, &TaskPath> = HashMap::new();

    for task in tasks {
        for output in &task.outputs {
            if let Some(existing) = producers.insert(output, &task.path) {
                if existing != &task.path {
                    return Err(KeelError::Dependency(format!(
                        "Output '{}' is declared by both '{}' and '{}'",
                        output.display(),
                        existing,
                        task.path
                    )));
                }
            }
        }
    }

    Ok(())
}

fn detect_cycles(tasks: &[TaskDescriptor]) -> Result<()> {
    let task_map: HashMap<&TaskPath, &TaskDescriptor> = tasks.iter().map(|t| (&t.path, t)).collect();
    let finalizes = finalizer_index(tasks);
    let mut visited = HashSet::new();

    for task in tasks {
        let mut path = Vec::new();

        if has_cycle(&task.path, &task_map, &finalizes, &mut visited, &mut path) {
            return Err(KeelError::Dependency(format!(
                "Circular dependency: {}",
                path.iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            )));
        }
    }

    Ok(())
}

fn has_cycle<'a>(
    task_id: &'a TaskPath,
    task_map: &HashMap<&'a TaskPath, &'a TaskDescriptor>,
    finalizes: &HashMap<&'a TaskPath, Vec<&'a TaskPath>>,
    visited: &mut HashSet<&'a TaskPath>,
    path: &mut Vec<&'a TaskPath>,
) -> bool {
    if path.contains(&task_id) {
        path.push(task_id);
        return true;
    }

    if visited.contains(task_id) {
        return false;
    }

    visited.insert(task_id);
    path.push(task_id);

    if let Some(&task) = task_map.get(task_id) {
        for dep in ordering_predecessors(task, finalizes) {
            if has_cycle(dep, task_map, finalizes, visited, path) {
                return true;
            }
        }
    }

    path.pop();

    false
}

/// Resolves command-line selectors. `:module:task` names one task, a bare
/// name selects that task in every module.
pub fn resolve_targets(tasks: &[TaskDescriptor], selectors: &[String]) -> Result<Vec<TaskPath>> {
    let mut targets = Vec::new();

    for selector in selectors {
        let matches: Vec<TaskPath> = if selector.starts_with(':') {
            tasks
                .iter()
                .filter(|t| t.path == selector.as_str())
                .map(|t| t.path.clone())
                .collect()
        } else {
            tasks
                .iter()
                .filter(|t| t.path.name() == selector)
                .map(|t| t.path.clone())
                .collect()
        };

        if matches.is_empty() {
            return Err(KeelError::Task(format!("Task '{}' not found", selector)));
        }

        for path in matches {
            if !targets.contains(&path) {
                targets.push(path);
            }
        }
    }

    Ok(targets)
}

/// Selects the targets, their dependency closure, and any finalizers they
/// pull in, then orders the result.
pub fn plan_execution(tasks: &[TaskDescriptor], targets: &[TaskPath]) -> Result<ExecutionPlan> {
    let task_map: HashMap<&TaskPath, &TaskDescriptor> = tasks.iter().map(|t| (&t.path, t)).collect();

    for target in targets {
        if !task_map.contains_key(target) {
            return Err(KeelError::Task(format!("Task '{}' not found", target)));
        }
    }

    let wired = dependency_closure(&task_map, targets.iter());
    let mut scheduled = wired.clone();

    // Finalizers may bring in finalizers and dependencies of their own.
    loop {
        let finalizers: Vec<&TaskPath> = scheduled
            .iter()
            .filter_map(|path| task_map.get(path))
            .flat_map(|task| task.finalized_by.iter())
            .filter(|finalizer| !scheduled.contains(*finalizer))
            .collect();

        if finalizers.is_empty() {
            break;
        }

        let closure = dependency_closure(&task_map, finalizers.into_iter());
        scheduled.extend(closure);
    }

    let selected: Vec<TaskDescriptor> = tasks
        .iter()
        .filter(|task| scheduled.contains(&task.path))
        .cloned()
        .collect();

    let order = sort_topologically(&selected);
    if order.len() != selected.len() {
        return Err(KeelError::Dependency(
            "Scheduled tasks contain an ordering cycle".to_string(),
        ));
    }

    debug!(
        "Planned {} task(s), {} on the target dependency path",
        order.len(),
        wired.len()
    );

    Ok(ExecutionPlan { order, wired })
}

fn dependency_closure<'a>(
    task_map: &HashMap<&'a TaskPath, &'a TaskDescriptor>,
    roots: impl Iterator<Item = &'a TaskPath>,
) -> HashSet<TaskPath> {
    let mut needed_tasks = HashSet::new();
    let mut queue: VecDeque<&TaskPath> = roots.collect();

    while let Some(current) = queue.pop_front() {
        if !needed_tasks.insert(current.clone()) {
            continue;
        }

        if let Some(&task) = task_map.get(current) {
            for dep in &task.dependencies {
                if !needed_tasks.contains(dep) {
                    queue.push_back(dep);
                }
            }
        }
    }

    needed_tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Action;

    fn task(path: &str, deps: &[&str]) -> TaskDescriptor {
        let mut task = TaskDescriptor::new(TaskPath::parse(path).unwrap(), Action::Lifecycle);
        task.dependencies = deps.iter().map(|d| TaskPath::parse(d).unwrap()).collect();
        task
    }

    fn paths(raw: &[&str]) -> Vec<TaskPath> {
        raw.iter().map(|p| TaskPath::parse(p).unwrap()).collect()
    }

    fn position(order: &[TaskPath], path: &str) -> usize {
        order.iter().position(|p| p == path).unwrap()
    }

    #[test]
    fn sorts_dependencies_before_dependents() {
        let tasks = vec![
            task(":backend:processResources", &[":frontend:copyElmApp"]),
            task(":frontend:copyElmApp", &[":frontend:elmMake", ":frontend:copyIndexHtml"]),
            task(":frontend:elmMake", &[]),
            task(":frontend:copyIndexHtml", &[]),
        ];

        let order = sort_topologically(&tasks);

        assert_eq!(order.len(), 4);
        assert!(position(&order, ":frontend:elmMake") < position(&order, ":frontend:copyElmApp"));
        assert!(
            position(&order, ":frontend:copyIndexHtml") < position(&order, ":frontend:copyElmApp")
        );
        assert!(
            position(&order, ":frontend:copyElmApp") < position(&order, ":backend:processResources")
        );
    }

    #[test]
    fn rejects_missing_and_self_dependencies() {
        let missing = vec![task(":check", &[":backend:pitest"])];
        let err = validate_tasks(&missing).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));

        let selfish = vec![task(":check", &[":check"])];
        let err = validate_tasks(&selfish).unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn rejects_cycles() {
        let tasks = vec![
            task(":a", &[":b"]),
            task(":b", &[":c"]),
            task(":c", &[":a"]),
        ];

        let err = validate_tasks(&tasks).unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn rejects_ordering_cycles_through_must_run_after() {
        let mut integration = task(":integrationTest", &[]);
        integration.must_run_after = paths(&[":test"]);
        let test = task(":test", &[":integrationTest"]);

        assert!(validate_tasks(&[integration, test]).is_err());
    }

    #[test]
    fn rejects_two_producers_for_one_output() {
        let mut first = task(":frontend:elmMake", &[]);
        first.outputs = vec![PathBuf::from("/p/frontend/build/elm.js")];
        let mut second = task(":frontend:elmLive", &[]);
        second.outputs = vec![PathBuf::from("/p/frontend/build/elm.js")];

        let err = validate_tasks(&[first, second]).unwrap_err();
        assert!(err.to_string().contains("declared by both"));
    }

    #[test]
    fn bare_selectors_match_every_module() {
        let tasks = vec![
            task(":frontend:build", &[]),
            task(":backend:build", &[]),
            task(":backend:test", &[]),
        ];

        let targets = resolve_targets(&tasks, &["build".to_string()]).unwrap();
        assert_eq!(targets, paths(&[":frontend:build", ":backend:build"]));

        let exact = resolve_targets(&tasks, &[":backend:test".to_string()]).unwrap();
        assert_eq!(exact, paths(&[":backend:test"]));

        assert!(resolve_targets(&tasks, &["deploy".to_string()]).is_err());
    }

    #[test]
    fn plan_contains_only_target_closure() {
        let tasks = vec![
            task(":frontend:elmMake", &[]),
            task(":frontend:copyIndexHtml", &[]),
            task(":frontend:stage", &[":frontend:elmMake", ":frontend:copyIndexHtml"]),
            task(":backend:compileJava", &[]),
        ];

        let plan = plan_execution(&tasks, &paths(&[":frontend:stage"])).unwrap();

        assert_eq!(plan.order.len(), 3);
        assert_eq!(plan.order.last().unwrap(), ":frontend:stage");
        assert!(!plan.order.iter().any(|p| p == ":backend:compileJava"));
        assert!(plan.order.iter().all(|p| plan.is_wired(p)));
    }

    #[test]
    fn finalizers_are_scheduled_but_not_wired() {
        let mut test = task(":backend:test", &[]);
        test.finalized_by = paths(&[":backend:coverageReport"]);
        let tasks = vec![
            task(":check", &[":backend:test"]),
            test,
            task(":backend:coverageReport", &[]),
        ];

        let plan = plan_execution(&tasks, &paths(&[":check"])).unwrap();

        assert_eq!(plan.order.len(), 3);
        assert!(position(&plan.order, ":backend:test") < position(&plan.order, ":backend:coverageReport"));
        assert!(plan.is_wired(&TaskPath::parse(":backend:test").unwrap()));
        assert!(!plan.is_wired(&TaskPath::parse(":backend:coverageReport").unwrap()));
    }

    #[test]
    fn must_run_after_orders_only_when_both_scheduled() {
        let mut integration = task(":backend:integrationTest", &[]);
        integration.must_run_after = paths(&[":backend:test"]);
        let tasks = vec![
            task(":check", &[":backend:test", ":backend:integrationTest"]),
            task(":backend:test", &[]),
            integration,
        ];

        let full = plan_execution(&tasks, &paths(&[":check"])).unwrap();
        assert!(
            position(&full.order, ":backend:test") < position(&full.order, ":backend:integrationTest")
        );

        let alone = plan_execution(&tasks, &paths(&[":backend:integrationTest"])).unwrap();
        assert_eq!(alone.order, paths(&[":backend:integrationTest"]));
    }
}
