use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::experiments::ppo::PpoConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub artifact_dir: PathBuf,
    pub seed: u64,
    pub n_envs: usize,
    pub verbose: bool,
}

/// Read PPO settings from JSON. Missing fields take their defaults.
pub fn load_ppo_config(path: &Path) -> Result<PpoConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read PPO config {}", path.display()))?;
    let config: PpoConfig = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse PPO config {}", path.display()))?;
    config.validate().with_context(|| format!("invalid PPO config {}", path.display()))?;
    Ok(config)
}
