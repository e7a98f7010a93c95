//! Writing task seeds into a store.

use std::path::Path;

use super::error::ConfigError;
use super::types::TaskSeed;
use crate::storage::{StorageError, TaskStore};

/// Upsert every seed. Claim state of existing tasks is left alone.
///
/// Returns the number of descriptors written.
pub async fn seed_tasks<S: TaskStore + ?Sized>(
    store: &S,
    seeds: &[TaskSeed],
) -> Result<usize, StorageError> {
    for seed in seeds {
        store.upsert_task(seed.to_stored()).await?;
        tracing::debug!(task = %seed.name, handler = seed.handler(), "task seeded");
    }
    Ok(seeds.len())
}

/// Load extra seeds from every `.yaml`/`.yml` file in `dir`.
///
/// Each file holds a YAML list of seeds. Files are read in name order.
pub fn load_seeds_from_directory(dir: impl AsRef<Path>) -> Result<Vec<TaskSeed>, ConfigError> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seeds = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path).map_err(|source| {
            ConfigError::FileReadError {
                path: path.clone(),
                source,
            }
        })?;
        let mut batch: Vec<TaskSeed> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.clone(),
                source,
            })?;
        seeds.append(&mut batch);
    }

    Ok(seeds)
}
