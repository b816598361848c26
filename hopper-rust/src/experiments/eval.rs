//! Episode-based policy evaluation.

use serde::Serialize;

use super::env::{seeded_rng, ConfigError, Environment};
use super::policy::Policy;

/// Reward statistics over a fixed number of complete episodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalResult {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub episode_returns: Vec<f64>,
    pub episode_lengths: Vec<usize>,
}

impl EvalResult {
    pub fn from_returns(episode_returns: Vec<f64>, episode_lengths: Vec<usize>) -> Self {
        let n = episode_returns.len().max(1) as f64;
        let mean = episode_returns.iter().sum::<f64>() / n;
        let std = (episode_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
        EvalResult { mean, std, episode_returns, episode_lengths }
    }

    pub fn min(&self) -> f64 {
        self.episode_returns.iter().cloned().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.episode_returns.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Run `n_episodes` full episodes of `policy` on `env`.
///
/// Episode k resets with `seed + k`; stochastic actions draw from a
/// generator seeded with `seed`. Each episode runs until the environment
/// signals termination or truncation.
pub fn evaluate_policy(
    policy: &impl Policy,
    env: &mut dyn Environment,
    n_episodes: usize,
    deterministic: bool,
    seed: u64,
) -> Result<EvalResult, ConfigError> {
    if n_episodes == 0 {
        return Err(ConfigError::InvalidCount { field: "n_eval_episodes", value: n_episodes });
    }

    let mut rng = seeded_rng(seed);
    let mut returns = Vec::with_capacity(n_episodes);
    let mut lengths = Vec::with_capacity(n_episodes);

    for ep in 0..n_episodes {
        let mut obs = env.reset(Some(seed.wrapping_add(ep as u64)));
        let mut ep_reward = 0.0;
        loop {
            let action = policy.act(&obs, deterministic, &mut rng);
            let result = env.step(&action);
            ep_reward += result.reward;
            if result.done() {
                break;
            }
            obs = result.observation;
        }
        let ep_len = env.steps();
        tracing::trace!(episode = ep, ret = ep_reward, len = ep_len, "evaluation episode");
        returns.push(ep_reward);
        lengths.push(ep_len);
    }

    Ok(EvalResult::from_returns(returns, lengths))
}
