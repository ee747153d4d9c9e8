use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::task::TaskPath;

const DEFAULT_CACHE_DIR: &str = ".keel";
const CACHE_FILENAME: &str = "keel_cache.json";

/// What a task looked like the last time it executed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub action: String,
    pub inputs: String,
    pub outputs: String,
    /// Files the task wrote, which may be a subset of what its declared
    /// output directories hold.
    pub produced: Vec<PathBuf>,
}

pub type Cache = HashMap<TaskPath, Fingerprint>;

pub fn load_cache(cache_path: &Path) -> Cache {
    let file = match File::open(cache_path) {
        Ok(file) => file,
        Err(_) => return Cache::default(),
    };

    let reader = BufReader::new(file);
    match serde_json::from_reader(reader) {
        Ok(cache) => cache,
        Err(e) => {
            warn!(
                "Ignoring unreadable cache '{}': {}",
                cache_path.display(),
                e
            );
            Cache::default()
        }
    }
}

pub fn save_cache(cache: &Cache, cache_path: &Path) {
    if let Some(parent) = cache_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("Failed to create cache directory: {}", e);
            return;
        }
    }

    match File::create(cache_path) {
        Ok(file) => {
            let writer = BufWriter::new(file);
            if let Err(e) = serde_json::to_writer_pretty(writer, cache) {
                warn!("Failed to write cache file: {}", e);
            } else {
                debug!("Saved {} fingerprint(s) to {}", cache.len(), cache_path.display());
            }
        }
        Err(e) => {
            warn!("Failed to open cache file for writing: {}", e);
        }
    }
}

pub fn get_cache_path(cache_dir: Option<&str>, root_dir: &Path) -> PathBuf {
    let cache_dir = cache_dir.unwrap_or(DEFAULT_CACHE_DIR);

    let cache_dir_path = if Path::new(cache_dir).is_absolute() {
        PathBuf::from(cache_dir)
    } else {
        root_dir.join(cache_dir)
    };

    cache_dir_path.join(CACHE_FILENAME)
}
