//! Deterministic rollout of a saved policy.

use anyhow::{bail, Result};
use serde::Serialize;

use super::env::{seeded_rng, ConfigError, EnvRegistry, Environment};
use super::hopper::Domain;
use super::policy::Policy;
use crate::storage::{artifact_name, ArtifactStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub steps: usize,
    /// Returns of episodes that finished within the step budget.
    pub episode_returns: Vec<f64>,
    /// Return accumulated by the episode still running at the end.
    pub partial_return: f64,
}

/// Step `policy` deterministically for `n_steps`, resetting whenever an
/// episode ends. Each finished episode's return is logged.
pub fn replay(
    policy: &impl Policy,
    env: &mut dyn Environment,
    n_steps: usize,
    seed: u64,
) -> Result<ReplaySummary, ConfigError> {
    if n_steps == 0 {
        return Err(ConfigError::InvalidCount { field: "steps", value: n_steps });
    }
    // Deterministic actions never draw from it.
    let mut rng = seeded_rng(seed);
    let mut episode = 0u64;
    let mut obs = env.reset(Some(seed));
    let mut summary = ReplaySummary::default();
    let mut ret = 0.0;

    for _ in 0..n_steps {
        let action = policy.act(&obs, true, &mut rng);
        let result = env.step(&action);
        ret += result.reward;
        summary.steps += 1;
        if result.done() {
            tracing::info!(episode, ret, len = env.steps(), truncated = result.truncated, "Episode finished");
            summary.episode_returns.push(ret);
            ret = 0.0;
            episode += 1;
            obs = env.reset(Some(seed.wrapping_add(episode)));
        } else {
            obs = result.observation;
        }
    }
    summary.partial_return = ret;
    Ok(summary)
}

/// Load the artifact trained on `model` and replay it on `env_domain`.
pub fn run(
    registry: &EnvRegistry,
    store: &ArtifactStore,
    model: Domain,
    env_domain: Domain,
    n_steps: usize,
    seed: u64,
) -> Result<ReplaySummary> {
    let name = artifact_name(model);
    let artifact = store.load(&name)?;
    let mut env = registry.make(env_domain.env_id(), Some(seed))?;

    let cfg = env.config();
    if artifact.obs_dim() != cfg.obs_dim() || artifact.act_dim() != cfg.act_dim() {
        bail!(
            "artifact {} expects obs/act dims {}/{}, environment {} has {}/{}",
            name,
            artifact.obs_dim(),
            artifact.act_dim(),
            cfg.id,
            cfg.obs_dim(),
            cfg.act_dim()
        );
    }
    tracing::info!(artifact = %name, trained_on = %artifact.env_id, env = %cfg.id, steps = n_steps, "Replaying policy");

    let summary = replay(&artifact, env.as_mut(), n_steps, seed)?;
    tracing::info!(
        episodes = summary.episode_returns.len(),
        partial_return = summary.partial_return,
        "Replay finished"
    );
    Ok(summary)
}
