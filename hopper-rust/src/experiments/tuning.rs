//! Trial-based hyperparameter search.
//!
//! A `Study` runs an objective for a fixed number of trials. Each trial asks
//! for named parameters through `suggest_int` / `suggest_float`; the values
//! come from a pluggable `Sampler`. The study keeps every finished trial and
//! reports the best one for its direction.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::env::{seeded_rng, ConfigError, EnvRegistry};
use super::eval::evaluate_policy;
use super::hopper;
use super::optim::CmaEs;
use super::ppo::{self, PpoConfig};
use super::vec_env::VecEnv;

// ─── Search space ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    Int { low: i64, high: i64 },
    Float { low: f64, high: f64, log: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ParamValue::Int(v) => v as f64,
            ParamValue::Float(v) => v,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            ParamValue::Int(v) => v,
            ParamValue::Float(v) => v.round() as i64,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl Distribution {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidDistribution { name: name.to_string(), reason });
        match *self {
            Distribution::Int { low, high } if low > high => invalid(format!("low {low} > high {high}")),
            Distribution::Int { .. } => Ok(()),
            Distribution::Float { low, high, .. } if !low.is_finite() || !high.is_finite() => {
                invalid("bounds must be finite".to_string())
            }
            Distribution::Float { low, high, .. } if low > high => invalid(format!("low {low} > high {high}")),
            Distribution::Float { low, log: true, .. } if low <= 0.0 => {
                invalid(format!("log scale needs low > 0, got {low}"))
            }
            Distribution::Float { .. } => Ok(()),
        }
    }

    pub fn contains(&self, value: &ParamValue) -> bool {
        match (*self, *value) {
            (Distribution::Int { low, high }, ParamValue::Int(v)) => v >= low && v <= high,
            (Distribution::Float { low, high, .. }, ParamValue::Float(v)) => v >= low && v <= high,
            _ => false,
        }
    }

    /// Independent draw: uniform, or log-uniform for log-scaled floats.
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> ParamValue {
        match *self {
            Distribution::Int { low, high } => ParamValue::Int(rng.gen_range(low..=high)),
            Distribution::Float { low, high, log: false } => ParamValue::Float(rng.gen_range(low..=high)),
            Distribution::Float { low, high, log: true } => {
                let v = rng.gen_range(low.ln()..=high.ln()).exp();
                ParamValue::Float(v.clamp(low, high))
            }
        }
    }

    /// Map a value into [0, 1] (log space for log-scaled floats).
    pub fn to_unit(&self, value: &ParamValue) -> f64 {
        let u = match *self {
            Distribution::Int { low, high } => {
                (value.as_f64() - low as f64 + 0.5) / ((high - low + 1) as f64)
            }
            Distribution::Float { low, high, .. } if high == low => 0.5,
            Distribution::Float { low, high, log: false } => (value.as_f64() - low) / (high - low),
            Distribution::Float { low, high, log: true } => {
                (value.as_f64().ln() - low.ln()) / (high.ln() - low.ln())
            }
        };
        u.clamp(0.0, 1.0)
    }

    /// Inverse of `to_unit`; out-of-cube inputs are clipped.
    pub fn from_unit(&self, u: f64) -> ParamValue {
        let u = if u.is_finite() { u.clamp(0.0, 1.0) } else { 0.5 };
        match *self {
            Distribution::Int { low, high } => {
                let span = (high - low + 1) as f64;
                ParamValue::Int((low + (u * span).floor() as i64).min(high))
            }
            Distribution::Float { low, high, log: false } => ParamValue::Float((low + u * (high - low)).clamp(low, high)),
            Distribution::Float { low, high, log: true } => {
                let v = (low.ln() + u * (high.ln() - low.ln())).exp();
                ParamValue::Float(v.clamp(low, high))
            }
        }
    }
}

// ─── Trials ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Complete,
    Failed,
}

/// A finished trial as recorded by the study.
#[derive(Debug, Clone, Serialize)]
pub struct FrozenTrial {
    pub number: usize,
    pub params: BTreeMap<String, ParamValue>,
    pub distributions: BTreeMap<String, Distribution>,
    pub value: Option<f64>,
    pub state: TrialState,
}

/// A running trial. Handed to the objective.
pub struct Trial<'a> {
    number: usize,
    sampler: &'a mut dyn Sampler,
    params: BTreeMap<String, ParamValue>,
    distributions: BTreeMap<String, Distribution>,
}

impl Trial<'_> {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64, ConfigError> {
        Ok(self.suggest(name, Distribution::Int { low, high })?.as_i64())
    }

    pub fn suggest_float(&mut self, name: &str, low: f64, high: f64, log: bool) -> Result<f64, ConfigError> {
        Ok(self.suggest(name, Distribution::Float { low, high, log })?.as_f64())
    }

    /// Asking for the same name twice returns the first value.
    pub fn suggest(&mut self, name: &str, dist: Distribution) -> Result<ParamValue, ConfigError> {
        dist.validate(name)?;
        if let Some(value) = self.params.get(name) {
            if self.distributions.get(name) != Some(&dist) {
                return Err(ConfigError::InvalidDistribution {
                    name: name.to_string(),
                    reason: "already suggested with a different distribution".to_string(),
                });
            }
            return Ok(*value);
        }
        let mut value = self.sampler.sample(name, &dist);
        if !dist.contains(&value) {
            value = dist.from_unit(dist.to_unit(&value));
        }
        self.params.insert(name.to_string(), value);
        self.distributions.insert(name.to_string(), dist);
        Ok(value)
    }
}

// ─── Samplers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Direction {
    fn better(self, a: f64, b: f64) -> bool {
        match self {
            Direction::Maximize => a > b,
            Direction::Minimize => a < b,
        }
    }
}

/// Strategy producing parameter values for trials.
pub trait Sampler {
    /// Called once before each trial with every trial finished so far.
    fn before_trial(&mut self, _history: &[FrozenTrial]) {}

    fn sample(&mut self, name: &str, dist: &Distribution) -> ParamValue;

    fn after_trial(&mut self, _trial: &FrozenTrial, _direction: Direction) {}
}

/// Independent uniform / log-uniform draws. No model of past results, so
/// it needs many more trials than a model-based sampler for the same quality.
pub struct RandomSampler {
    rng: ChaCha8Rng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self { rng: seeded_rng(seed) }
    }
}

impl Sampler for RandomSampler {
    fn sample(&mut self, _name: &str, dist: &Distribution) -> ParamValue {
        dist.sample(&mut self.rng)
    }
}

/// CMA-ES over the unit cube of the search space.
///
/// The first trial is sampled at random; its distributions fix the space.
/// Parameters outside that space keep falling back to random draws.
pub struct CmaEsSampler {
    seed: u64,
    random: RandomSampler,
    space: Option<Vec<(String, Distribution)>>,
    cma: Option<CmaEs>,
    pending: Vec<Vec<f64>>,
    current: Option<Vec<f64>>,
    told: Vec<(Vec<f64>, f64)>,
}

impl CmaEsSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            random: RandomSampler::new(seed ^ 0x5eed),
            space: None,
            cma: None,
            pending: Vec::new(),
            current: None,
            told: Vec::new(),
        }
    }
}

impl Sampler for CmaEsSampler {
    fn before_trial(&mut self, _history: &[FrozenTrial]) {
        let Some(space) = &self.space else { return };
        let cma = self
            .cma
            .get_or_insert_with(|| CmaEs::new(vec![0.5; space.len()], 1.0 / 6.0, None, self.seed));
        if self.pending.is_empty() {
            self.pending = cma.ask();
            self.pending.reverse();
        }
        self.current = self.pending.pop().map(|x| x.into_iter().map(|u| u.clamp(0.0, 1.0)).collect());
    }

    fn sample(&mut self, name: &str, dist: &Distribution) -> ParamValue {
        if let (Some(space), Some(current)) = (&self.space, &self.current) {
            if let Some(i) = space.iter().position(|(n, d)| n == name && d == dist) {
                return dist.from_unit(current[i]);
            }
        }
        self.random.sample(name, dist)
    }

    fn after_trial(&mut self, trial: &FrozenTrial, direction: Direction) {
        if self.space.is_none() {
            if !trial.distributions.is_empty() {
                self.space = Some(trial.distributions.iter().map(|(n, d)| (n.clone(), *d)).collect());
            }
            return;
        }
        let Some(x) = self.current.take() else { return };
        let fitness = match (trial.state, trial.value) {
            (TrialState::Complete, Some(v)) if direction == Direction::Maximize => v,
            (TrialState::Complete, Some(v)) => -v,
            _ => f64::NEG_INFINITY,
        };
        self.told.push((x, fitness));

        if let Some(cma) = &mut self.cma {
            if self.told.len() == cma.pop_size {
                let (xs, fs): (Vec<_>, Vec<_>) = self.told.drain(..).unzip();
                cma.tell(&xs, &fs);
                tracing::debug!(generation = cma.gen, sigma = cma.sigma, "CMA-ES generation");
            }
        }
    }
}

/// Sampler selection for the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SamplerKind {
    Random,
    CmaEs,
}

impl SamplerKind {
    pub fn build(self, seed: u64) -> Box<dyn Sampler> {
        match self {
            SamplerKind::Random => Box::new(RandomSampler::new(seed)),
            SamplerKind::CmaEs => Box::new(CmaEsSampler::new(seed)),
        }
    }
}

// ─── Study ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyState {
    Searching,
    Done,
}

pub struct Study {
    direction: Direction,
    state: StudyState,
    sampler: Box<dyn Sampler>,
    trials: Vec<FrozenTrial>,
}

#[derive(Serialize)]
struct StudyReport<'a> {
    direction: Direction,
    state: StudyState,
    best_trial: Option<&'a FrozenTrial>,
    trials: &'a [FrozenTrial],
}

impl Study {
    pub fn new(direction: Direction, sampler: Box<dyn Sampler>) -> Self {
        Self { direction, state: StudyState::Searching, sampler, trials: Vec::new() }
    }

    pub fn state(&self) -> StudyState {
        self.state
    }

    pub fn trials(&self) -> &[FrozenTrial] {
        &self.trials
    }

    /// Run `n_trials` more trials. Objective errors abort the study;
    /// non-finite values only fail the trial.
    pub fn optimize<F>(&mut self, mut objective: F, n_trials: usize) -> Result<()>
    where
        F: FnMut(&mut Trial<'_>) -> Result<f64>,
    {
        self.state = StudyState::Searching;
        for _ in 0..n_trials {
            let number = self.trials.len();
            self.sampler.before_trial(&self.trials);

            let start = Instant::now();
            let mut trial = Trial {
                number,
                sampler: self.sampler.as_mut(),
                params: BTreeMap::new(),
                distributions: BTreeMap::new(),
            };
            let value = objective(&mut trial).with_context(|| format!("trial {number} failed"))?;
            let Trial { params, distributions, .. } = trial;

            let frozen = if value.is_finite() {
                FrozenTrial { number, params, distributions, value: Some(value), state: TrialState::Complete }
            } else {
                tracing::warn!(trial = number, value, "Objective returned a non-finite value");
                FrozenTrial { number, params, distributions, value: None, state: TrialState::Failed }
            };
            self.sampler.after_trial(&frozen, self.direction);
            self.trials.push(frozen);

            let best = self.best_value();
            tracing::info!(
                trial = number,
                value,
                best = best.unwrap_or(f64::NAN),
                elapsed_s = start.elapsed().as_secs_f64(),
                "Trial finished"
            );
        }
        self.state = StudyState::Done;
        Ok(())
    }

    pub fn best_trial(&self) -> Option<&FrozenTrial> {
        let mut best: Option<&FrozenTrial> = None;
        for t in self.trials.iter().filter(|t| t.state == TrialState::Complete) {
            let (Some(v), current) = (t.value, best.and_then(|b| b.value)) else { continue };
            if current.map_or(true, |c| self.direction.better(v, c)) {
                best = Some(t);
            }
        }
        best
    }

    pub fn best_params(&self) -> Option<&BTreeMap<String, ParamValue>> {
        self.best_trial().map(|t| &t.params)
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best_trial().and_then(|t| t.value)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let report = StudyReport {
            direction: self.direction,
            state: self.state,
            best_trial: self.best_trial(),
            trials: &self.trials,
        };
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("failed to write study {}", path.display()))?;
        tracing::info!(path = %path.display(), trials = self.trials.len(), "Saved study");
        Ok(())
    }
}

// ─── PPO search ─────────────────────────────────────────────────────

/// Draw the searched PPO settings on top of `base`.
pub fn sample_ppo_params(trial: &mut Trial<'_>, base: &PpoConfig) -> Result<PpoConfig, ConfigError> {
    Ok(PpoConfig {
        n_steps: trial.suggest_int("n_steps", 2048, 8192)? as usize,
        gamma: trial.suggest_float("gamma", 0.9, 0.9999, true)?,
        learning_rate: trial.suggest_float("learning_rate", 1e-5, 1e-2, true)?,
        ent_coef: trial.suggest_float("ent_coef", 0.0, 0.1, false)?,
        clip_range: trial.suggest_float("clip_range", 0.1, 0.4, false)?,
        n_epochs: trial.suggest_int("n_epochs", 1, 10)? as usize,
        ..base.clone()
    })
}

#[derive(Debug, Clone)]
pub struct TuneSettings {
    pub env_id: String,
    pub total_timesteps: usize,
    pub n_eval_episodes: usize,
    pub n_envs: usize,
    pub seed: u64,
    pub base: PpoConfig,
}

impl Default for TuneSettings {
    fn default() -> Self {
        Self {
            env_id: hopper::SOURCE_ID.to_string(),
            total_timesteps: 100_000,
            n_eval_episodes: 10,
            n_envs: 4,
            seed: 0,
            base: PpoConfig::default(),
        }
    }
}

/// Train a fresh policy with the trial's settings and score it by mean
/// evaluation return.
pub fn ppo_objective<'r>(
    registry: &'r EnvRegistry,
    settings: TuneSettings,
) -> impl FnMut(&mut Trial<'_>) -> Result<f64> + 'r {
    move |trial: &mut Trial<'_>| {
        let config = sample_ppo_params(trial, &settings.base)?;
        let seed = settings.seed.wrapping_add(trial.number() as u64);
        let mut venv = VecEnv::new(registry, &settings.env_id, settings.n_envs, seed)?;
        let artifact = ppo::learn(&mut venv, &config, settings.total_timesteps, seed, |s| ppo::log_update(s, false))?;

        let mut env = registry.make(&settings.env_id, Some(seed))?;
        let result = evaluate_policy(&artifact, env.as_mut(), settings.n_eval_episodes, false, seed)?;
        Ok(result.mean)
    }
}
