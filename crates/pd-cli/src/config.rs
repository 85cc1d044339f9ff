use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use pd_infra::config::ClusterConfig;
use pd_infra::types::Instance;

const YAML_EXTENSION: &str = "yaml";

pub fn load_cluster(path: &Path) -> Result<ClusterConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cluster config {}", path.display()))?;

    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse cluster config {}", path.display()))
}

/// Load every `*.yaml` file under `dir` (recursively) as one declared
/// instance per file.
pub fn load_instances(dir: &Path) -> Result<Vec<Instance>> {
    let mut instances = Vec::new();

    for entry in WalkDir::new(dir) {
        let entry =
            entry.with_context(|| format!("failed to walk instances dir {}", dir.display()))?;

        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|e| e.to_str()) != Some(YAML_EXTENSION)
        {
            continue;
        }

        let raw = std::fs::read_to_string(entry.path())
            .with_context(|| format!("failed to read instance file {}", entry.path().display()))?;

        let instance: Instance = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse instance file {}", entry.path().display()))?;

        instances.push(instance);
    }

    Ok(instances)
}
