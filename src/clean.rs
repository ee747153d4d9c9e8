use std::path::PathBuf;

use tracing::debug;

use crate::{cache::Cache, error::Result, task::TaskDescriptor, util::remove_paths};

/// Removes every declared output and forgets every fingerprint.
pub fn clean_outputs(tasks: &[TaskDescriptor], cache: &mut Cache) -> Result<Vec<PathBuf>> {
    let mut declared: Vec<PathBuf> = tasks
        .iter()
        .flat_map(|task| task.outputs.iter().cloned())
        .collect();
    // Parents first, so nested outputs are gone with them.
    declared.sort();
    declared.dedup();

    let removed = remove_paths(&declared)?;
    for path in &removed {
        println!("Removed {}", path.display());
    }

    debug!("Clearing {} fingerprint(s)", cache.len());
    cache.clear();

    Ok(removed)
}
