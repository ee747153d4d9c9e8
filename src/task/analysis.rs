use std::{collections::HashMap, path::Path};

use tracing::info;

use super::{TaskDescriptor, TaskPath};
use crate::util::is_glob_pattern;

/// Logs dependency edges that carry no file between the two tasks.
///
/// Returns the `(task, dependency)` pairs that are ordering-only.
pub fn show_task_relationships(tasks: &[TaskDescriptor]) -> Vec<(TaskPath, TaskPath)> {
    let task_map: HashMap<&TaskPath, &TaskDescriptor> = tasks.iter().map(|t| (&t.path, t)).collect();
    let mut ordering_only = Vec::new();

    for task in tasks {
        for dep_id in &task.dependencies {
            if let Some(dep_task) = task_map.get(dep_id) {
                if dep_task.action.is_lifecycle() || task.action.is_lifecycle() {
                    continue;
                }
                if !has_file_relationship(task, dep_task) {
                    info!(
                        "Task '{}' depends on '{}' for ordering only",
                        task.path, dep_id
                    );
                    ordering_only.push((task.path.clone(), dep_id.clone()));
                }
            }
        }
    }

    ordering_only
}

fn has_file_relationship(task: &TaskDescriptor, dependency: &TaskDescriptor) -> bool {
    if dependency.outputs.is_empty() || task.inputs.is_empty() {
        return false;
    }

    dependency.outputs.iter().any(|dep_output| {
        task.inputs
            .iter()
            .any(|task_input| paths_match(dep_output, task_input))
    })
}

fn paths_match(output: &Path, input: &Path) -> bool {
    if output == input || output.starts_with(input) || input.starts_with(output) {
        return true;
    }

    let input_str = input.to_string_lossy();

    if is_glob_pattern(&input_str) {
        if let Ok(pattern) = glob::Pattern::new(&input_str) {
            if pattern.matches_path(output) {
                return true;
            }
        }
    }

    if input_str.contains("**") {
        if let Some(prefix) = input_str.split("**").next() {
            if !prefix.is_empty() && output.to_string_lossy().starts_with(prefix) {
                return true;
            }
        }
    }

    false
}
