use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::experiments::hopper::Domain;
use crate::experiments::policy::PolicyArtifact;

const ARTIFACT_PREFIX: &str = "model_ppo";

/// Name under which the policy trained on `domain` is saved and loaded.
/// Trainer and replay both go through this, so the names always agree.
pub fn artifact_name(domain: Domain) -> String {
    format!("{}_{}", ARTIFACT_PREFIX, domain.label())
}

/// Directory of named policy artifacts, one JSON file each.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn save(&self, name: &str, artifact: &PolicyArtifact) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create artifact directory {}", self.dir.display()))?;
        let path = self.path_for(name);
        let json = serde_json::to_string(artifact)?;
        fs::write(&path, json).with_context(|| format!("failed to write artifact {}", path.display()))?;
        tracing::info!(path = %path.display(), env = %artifact.env_id, timesteps = artifact.timesteps, "Saved policy artifact");
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<PolicyArtifact> {
        let path = self.path_for(name);
        load_artifact(&path)
    }
}

pub fn load_artifact(path: &Path) -> Result<PolicyArtifact> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read artifact {}", path.display()))?;
    let artifact = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse artifact {}", path.display()))?;
    Ok(artifact)
}
