//! Feed-forward actor/critic networks with manual forward + backward pass.
//!
//! Weights are plain `Vec<f64>` per layer, row-major `(fan_in, fan_out)`,
//! tanh on hidden layers, linear output. The trained artifact bundles the
//! actor, the critic and a learnable log standard deviation, and is what
//! gets saved to disk and replayed.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::ppo::PpoConfig;

pub const LOG_STD_MIN: f64 = -2.0;
pub const LOG_STD_MAX: f64 = 0.5;
pub const LOG_STD_INIT: f64 = -0.5;

const LN_2PI: f64 = 1.8378770664093453;

/// Anything that maps an observation to an action.
pub trait Policy {
    /// Deterministic selection returns the mode of the action distribution.
    fn act(&self, obs: &[f32], deterministic: bool, rng: &mut ChaCha8Rng) -> Vec<f32>;
}

// ─── Network ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlp {
    pub layer_dims: Vec<(usize, usize)>,
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<Vec<f64>>,
}

/// Activations kept from the forward pass for backprop.
pub struct ForwardResult {
    pub output: Vec<f64>,
    pre_activations: Vec<Vec<f64>>,
    post_activations: Vec<Vec<f64>>,
}

/// Per-layer gradients, same shapes as the network.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<Vec<f64>>,
}

impl Gradients {
    pub fn add(&mut self, other: &Gradients) {
        for l in 0..self.weights.len() {
            for (a, b) in self.weights[l].iter_mut().zip(&other.weights[l]) { *a += b; }
            for (a, b) in self.biases[l].iter_mut().zip(&other.biases[l]) { *a += b; }
        }
    }

    /// Layer-major flattening, matching [`Mlp::apply_updates`].
    pub fn flatten_into(&self, out: &mut Vec<f64>) {
        for l in 0..self.weights.len() {
            out.extend_from_slice(&self.weights[l]);
            out.extend_from_slice(&self.biases[l]);
        }
    }
}

impl Mlp {
    /// Xavier-initialized weights, zero biases.
    pub fn new(input: usize, output: usize, hidden: &[usize], rng: &mut ChaCha8Rng) -> Self {
        let mut dims = Vec::new();
        let mut prev = input;
        for &h in hidden {
            dims.push((prev, h));
            prev = h;
        }
        dims.push((prev, output));

        let mut weights = Vec::with_capacity(dims.len());
        let mut biases = Vec::with_capacity(dims.len());
        for &(fan_in, fan_out) in &dims {
            let std = (2.0 / (fan_in + fan_out) as f64).sqrt();
            let w: Vec<f64> = (0..fan_in * fan_out)
                .map(|_| rng.sample::<f64, _>(StandardNormal) * std)
                .collect();
            weights.push(w);
            biases.push(vec![0.0; fan_out]);
        }
        Mlp { layer_dims: dims, weights, biases }
    }

    pub fn n_params(&self) -> usize {
        self.layer_dims.iter().map(|(i, o)| i * o + o).sum()
    }

    pub fn input_dim(&self) -> usize {
        self.layer_dims.first().map_or(0, |d| d.0)
    }

    pub fn output_dim(&self) -> usize {
        self.layer_dims.last().map_or(0, |d| d.1)
    }

    /// Forward pass returning the output plus activations for backprop.
    pub fn forward(&self, obs: &[f64]) -> ForwardResult {
        let mut x = obs.to_vec();
        let mut pre_activations = Vec::with_capacity(self.layer_dims.len());
        let mut post_activations = Vec::with_capacity(self.layer_dims.len() + 1);
        post_activations.push(x.clone());

        for (layer_idx, &(fan_in, fan_out)) in self.layer_dims.iter().enumerate() {
            let w = &self.weights[layer_idx];
            let b = &self.biases[layer_idx];

            // z = x @ W + b
            let mut z = vec![0.0; fan_out];
            for j in 0..fan_out {
                let mut sum = b[j];
                for i in 0..fan_in {
                    sum += x[i] * w[i * fan_out + j];
                }
                z[j] = sum;
            }

            let is_last = layer_idx == self.layer_dims.len() - 1;
            let a: Vec<f64> = if is_last { z.clone() } else { z.iter().map(|v| v.tanh()).collect() };
            pre_activations.push(z);
            post_activations.push(a.clone());
            x = a;
        }

        ForwardResult { output: x, pre_activations, post_activations }
    }

    /// Output only.
    pub fn predict(&self, obs: &[f64]) -> Vec<f64> {
        self.forward(obs).output
    }

    /// Backward pass for a given dL/d(output).
    pub fn backward(&self, fwd: &ForwardResult, d_output: &[f64]) -> Gradients {
        let n_layers = self.layer_dims.len();
        let mut d_weights = vec![Vec::new(); n_layers];
        let mut d_biases = vec![Vec::new(); n_layers];
        let mut delta = d_output.to_vec();

        for layer_idx in (0..n_layers).rev() {
            let (fan_in, fan_out) = self.layer_dims[layer_idx];
            if layer_idx != n_layers - 1 {
                let z = &fwd.pre_activations[layer_idx];
                for j in 0..fan_out {
                    let t = z[j].tanh();
                    delta[j] *= 1.0 - t * t;
                }
            }

            d_biases[layer_idx] = delta.clone();

            let a_prev = &fwd.post_activations[layer_idx];
            let mut dw = vec![0.0; fan_in * fan_out];
            for i in 0..fan_in {
                for j in 0..fan_out {
                    dw[i * fan_out + j] = a_prev[i] * delta[j];
                }
            }
            d_weights[layer_idx] = dw;

            if layer_idx > 0 {
                let w = &self.weights[layer_idx];
                let mut delta_prev = vec![0.0; fan_in];
                for i in 0..fan_in {
                    for j in 0..fan_out {
                        delta_prev[i] += w[i * fan_out + j] * delta[j];
                    }
                }
                delta = delta_prev;
            }
        }

        Gradients { weights: d_weights, biases: d_biases }
    }

    pub fn zero_gradients(&self) -> Gradients {
        Gradients {
            weights: self.weights.iter().map(|w| vec![0.0; w.len()]).collect(),
            biases: self.biases.iter().map(|b| vec![0.0; b.len()]).collect(),
        }
    }

    /// Subtract a flat update vector (layer-major, weights then biases).
    /// Returns how many entries were consumed.
    pub fn apply_updates(&mut self, updates: &[f64]) -> usize {
        let mut offset = 0;
        for layer_idx in 0..self.layer_dims.len() {
            for w in self.weights[layer_idx].iter_mut() {
                *w -= updates[offset];
                offset += 1;
            }
            for b in self.biases[layer_idx].iter_mut() {
                *b -= updates[offset];
                offset += 1;
            }
        }
        offset
    }

    /// Format network architecture as string.
    pub fn arch_string(&self) -> String {
        let mut parts = vec![self.input_dim().to_string()];
        for &(_, o) in &self.layer_dims {
            parts.push(o.to_string());
        }
        parts.join("→")
    }
}

// ─── Squashed Gaussian ───────────────────────────────────────────────

/// Gaussian log-density of the pre-squash sample. The tanh correction term
/// does not depend on the parameters and cancels in PPO ratios.
pub fn gaussian_log_prob(raw: &[f64], mean: &[f64], log_std: &[f64]) -> f64 {
    raw.iter()
        .zip(mean)
        .zip(log_std)
        .map(|((&r, &m), &ls)| {
            let ls = ls.clamp(LOG_STD_MIN, LOG_STD_MAX);
            let z = (r - m) / ls.exp();
            -0.5 * z * z - ls - 0.5 * LN_2PI
        })
        .sum()
}

/// Differential entropy of the diagonal Gaussian.
pub fn gaussian_entropy(log_std: &[f64]) -> f64 {
    log_std.iter().map(|ls| ls.clamp(LOG_STD_MIN, LOG_STD_MAX) + 0.5 * (LN_2PI + 1.0)).sum()
}

// ─── Artifact ────────────────────────────────────────────────────────

/// A trained actor-critic, ready to be saved, loaded and replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyArtifact {
    pub env_id: String,
    pub actor: Mlp,
    pub critic: Mlp,
    pub log_std: Vec<f64>,
    pub config: PpoConfig,
    pub timesteps: usize,
    pub seed: u64,
    /// Wall-clock completion time. The one field a seeded rerun does not reproduce.
    pub trained_at: DateTime<Utc>,
}

impl PolicyArtifact {
    pub fn new(env_id: &str, obs_dim: usize, act_dim: usize, config: &PpoConfig, seed: u64, rng: &mut ChaCha8Rng) -> Self {
        PolicyArtifact {
            env_id: env_id.to_string(),
            actor: Mlp::new(obs_dim, act_dim, &config.hidden, rng),
            critic: Mlp::new(obs_dim, 1, &config.hidden, rng),
            log_std: vec![LOG_STD_INIT; act_dim],
            config: config.clone(),
            timesteps: 0,
            seed,
            trained_at: Utc::now(),
        }
    }

    pub fn obs_dim(&self) -> usize {
        self.actor.input_dim()
    }

    pub fn act_dim(&self) -> usize {
        self.actor.output_dim()
    }

    pub fn value(&self, obs: &[f64]) -> f64 {
        self.critic.predict(obs)[0]
    }

    /// Sample a squashed-Gaussian action. Returns (action, raw sample, log-prob).
    pub fn sample(&self, mean: &[f64], rng: &mut ChaCha8Rng) -> (Vec<f32>, Vec<f64>, f64) {
        let raw: Vec<f64> = mean
            .iter()
            .zip(&self.log_std)
            .map(|(&m, &ls)| {
                let std = ls.clamp(LOG_STD_MIN, LOG_STD_MAX).exp();
                m + std * rng.sample::<f64, _>(StandardNormal)
            })
            .collect();
        let log_prob = gaussian_log_prob(&raw, mean, &self.log_std);
        let action = raw.iter().map(|r| r.tanh() as f32).collect();
        (action, raw, log_prob)
    }

    pub fn mean_std(&self) -> f64 {
        let n = self.log_std.len().max(1) as f64;
        self.log_std.iter().map(|ls| ls.clamp(LOG_STD_MIN, LOG_STD_MAX).exp()).sum::<f64>() / n
    }
}

impl Policy for PolicyArtifact {
    fn act(&self, obs: &[f32], deterministic: bool, rng: &mut ChaCha8Rng) -> Vec<f32> {
        let obs64: Vec<f64> = obs.iter().map(|&v| v as f64).collect();
        let mean = self.actor.predict(&obs64);
        if deterministic {
            mean.iter().map(|m| m.tanh() as f32).collect()
        } else {
            self.sample(&mean, rng).0
        }
    }
}
