//! Environment abstraction for the hopper experiments.
//!
//! Mirrors gymnasium's API in pure Rust. Environments are resolved by id
//! through an explicit [`EnvRegistry`] that is populated once at process
//! start, never as a side effect of loading a module.

use std::collections::BTreeMap;
use std::fmt;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Continuous box space: one `[low, high]` interval per dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxSpace {
    pub low: Vec<f32>,
    pub high: Vec<f32>,
}

impl BoxSpace {
    /// Same bounds on every dimension.
    pub fn uniform(dim: usize, low: f32, high: f32) -> Self {
        BoxSpace { low: vec![low; dim], high: vec![high; dim] }
    }

    pub fn dim(&self) -> usize {
        self.low.len()
    }
}

impl fmt::Display for BoxSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = self.low.iter().cloned().fold(f32::INFINITY, f32::min);
        let hi = self.high.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        write!(f, "Box({lo}, {hi}, ({},), float32)", self.dim())
    }
}

/// Result of a step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Vec<f32>,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
}

impl StepResult {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Static description of a registered environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub id: String,
    pub observation_space: BoxSpace,
    pub action_space: BoxSpace,
    pub max_steps: usize,
}

impl EnvConfig {
    pub fn obs_dim(&self) -> usize {
        self.observation_space.dim()
    }

    pub fn act_dim(&self) -> usize {
        self.action_space.dim()
    }
}

impl fmt::Display for EnvConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (obs={}, act={}, max_steps={})",
            self.id, self.observation_space, self.action_space, self.max_steps)
    }
}

/// The core Environment trait.
///
/// `Send` so a [`super::vec_env::VecEnv`] can step its copies on the rayon pool.
pub trait Environment: Send {
    /// Reset to an initial state and return the first observation.
    /// `Some(seed)` reseeds the environment's generator first.
    fn reset(&mut self, seed: Option<u64>) -> Vec<f32>;

    /// Apply an action.
    fn step(&mut self, action: &[f32]) -> StepResult;

    fn config(&self) -> &EnvConfig;

    /// Steps taken in the current episode.
    fn steps(&self) -> usize;

    /// Physical simulation parameters (link masses for the hopper).
    fn parameters(&self) -> Vec<f64> {
        Vec::new()
    }
}

/// Constructor stored in the registry. Receives the initial seed.
pub type EnvFactory = fn(Option<u64>) -> Box<dyn Environment>;

/// Configuration errors raised before any training or evaluation starts.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// No environment registered under this id.
    UnknownEnvironment { id: String, known: Vec<String> },
    /// An id was registered twice.
    DuplicateEnvironment { id: String },
    /// A count parameter must be positive.
    InvalidCount { field: &'static str, value: usize },
    /// A parameter is outside its valid range.
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
    /// A search-space distribution is malformed.
    InvalidDistribution { name: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownEnvironment { id, known } => {
                write!(f, "unknown environment id '{}' (registered: {})", id, known.join(", "))
            }
            ConfigError::DuplicateEnvironment { id } => {
                write!(f, "environment id '{}' is already registered", id)
            }
            ConfigError::InvalidCount { field, value } => {
                write!(f, "{} must be > 0, got {}", field, value)
            }
            ConfigError::OutOfRange { field, value, min, max } => {
                write!(f, "{} must be in [{}, {}], got {}", field, min, max, value)
            }
            ConfigError::InvalidDistribution { name, reason } => {
                write!(f, "invalid distribution for '{}': {}", name, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Registry of known environments, keyed by id.
#[derive(Default, Clone)]
pub struct EnvRegistry {
    factories: BTreeMap<String, EnvFactory>,
}

impl EnvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, factory: EnvFactory) -> Result<(), ConfigError> {
        if self.factories.contains_key(id) {
            return Err(ConfigError::DuplicateEnvironment { id: id.to_string() });
        }
        self.factories.insert(id.to_string(), factory);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Fails fast on unknown ids, so callers can check before training.
    pub fn resolve(&self, id: &str) -> Result<EnvFactory, ConfigError> {
        self.factories.get(id).copied().ok_or_else(|| ConfigError::UnknownEnvironment {
            id: id.to_string(),
            known: self.ids(),
        })
    }

    /// Factory: create a single environment by id.
    pub fn make(&self, id: &str, seed: Option<u64>) -> Result<Box<dyn Environment>, ConfigError> {
        let factory = self.resolve(id)?;
        Ok(factory(seed))
    }
}

impl fmt::Debug for EnvRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvRegistry").field("ids", &self.ids()).finish()
    }
}

/// Seeded generator used by environments and learners.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Tiny deterministic environment for orchestration tests.
    use super::*;

    /// Reward 1.0 per step. The episode ends after exactly 10 steps, by
    /// termination or (for [`TRUNCATING_ID`]) by a time-limit cut.
    pub struct ConstantEnv {
        config: EnvConfig,
        step_count: usize,
        truncate: bool,
    }

    pub const CONSTANT_ID: &str = "Constant-v0";
    pub const TRUNCATING_ID: &str = "Truncating-v0";
    pub const EPISODE_LEN: usize = 10;

    impl ConstantEnv {
        pub fn new(id: &str, truncate: bool) -> Self {
            ConstantEnv {
                config: EnvConfig {
                    id: id.to_string(),
                    observation_space: BoxSpace::uniform(2, -1.0, 1.0),
                    action_space: BoxSpace::uniform(1, -1.0, 1.0),
                    max_steps: EPISODE_LEN,
                },
                step_count: 0,
                truncate,
            }
        }
    }

    impl Environment for ConstantEnv {
        fn reset(&mut self, _seed: Option<u64>) -> Vec<f32> {
            self.step_count = 0;
            vec![0.0, 0.0]
        }

        fn step(&mut self, _action: &[f32]) -> StepResult {
            self.step_count += 1;
            let ended = self.step_count >= EPISODE_LEN;
            StepResult {
                observation: vec![self.step_count as f32 / EPISODE_LEN as f32, 0.0],
                reward: 1.0,
                terminated: ended && !self.truncate,
                truncated: ended && self.truncate,
            }
        }

        fn config(&self) -> &EnvConfig { &self.config }
        fn steps(&self) -> usize { self.step_count }
    }

    pub fn make_constant(_seed: Option<u64>) -> Box<dyn Environment> {
        Box::new(ConstantEnv::new(CONSTANT_ID, false))
    }

    pub fn make_truncating(_seed: Option<u64>) -> Box<dyn Environment> {
        Box::new(ConstantEnv::new(TRUNCATING_ID, true))
    }

    pub fn registry() -> EnvRegistry {
        let mut registry = EnvRegistry::new();
        registry.register(CONSTANT_ID, make_constant).unwrap();
        registry.register(TRUNCATING_ID, make_truncating).unwrap();
        registry
    }
}
