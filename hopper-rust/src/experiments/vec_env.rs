//! Vectorized environment: N independent copies stepped together.
//!
//! Copies are stepped on the rayon pool. Each copy owns its RNG, so the
//! result does not depend on scheduling. Finished copies reset
//! automatically; the terminal observation of a truncated episode is kept
//! so the learner can bootstrap its value.

use rayon::prelude::*;

use super::env::{ConfigError, EnvConfig, EnvRegistry, Environment};

/// Outcome of stepping every copy once.
#[derive(Debug, Clone)]
pub struct VecStep {
    /// Next observation per copy (first observation of the new episode
    /// if the copy was reset).
    pub observations: Vec<Vec<f32>>,
    pub rewards: Vec<f64>,
    pub terminated: Vec<bool>,
    pub truncated: Vec<bool>,
    /// Last observation of an episode that was cut off by the time limit.
    pub terminal_observations: Vec<Option<Vec<f32>>>,
    /// Return and length of any episode that finished on this step.
    pub finished: Vec<Option<EpisodeStats>>,
}

impl VecStep {
    pub fn done(&self, i: usize) -> bool {
        self.terminated[i] || self.truncated[i]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeStats {
    pub ret: f64,
    pub len: usize,
}

struct Slot {
    env: Box<dyn Environment>,
    seed: u64,
    episodes: u64,
    ep_return: f64,
    ep_len: usize,
}

/// A batch of environment copies built from one registered id.
pub struct VecEnv {
    slots: Vec<Slot>,
    config: EnvConfig,
}

impl VecEnv {
    /// Build `n_envs` copies of `id`; copy i is seeded with `seed + i`.
    pub fn new(registry: &EnvRegistry, id: &str, n_envs: usize, seed: u64) -> Result<Self, ConfigError> {
        if n_envs == 0 {
            return Err(ConfigError::InvalidCount { field: "n_envs", value: n_envs });
        }
        let factory = registry.resolve(id)?;
        let slots: Vec<Slot> = (0..n_envs)
            .map(|i| {
                let env_seed = seed.wrapping_add(i as u64);
                Slot { env: factory(Some(env_seed)), seed: env_seed, episodes: 0, ep_return: 0.0, ep_len: 0 }
            })
            .collect();
        let config = slots[0].env.config().clone();
        Ok(VecEnv { slots, config })
    }

    pub fn num_envs(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Reset every copy; returns stacked observations.
    pub fn reset(&mut self) -> Vec<Vec<f32>> {
        self.slots
            .par_iter_mut()
            .map(|slot| {
                slot.episodes = 0;
                slot.ep_return = 0.0;
                slot.ep_len = 0;
                slot.env.reset(Some(slot.seed))
            })
            .collect()
    }

    /// Step every copy with its own action.
    pub fn step(&mut self, actions: &[Vec<f32>]) -> VecStep {
        assert_eq!(actions.len(), self.slots.len(), "one action per environment copy");

        let results: Vec<_> = self
            .slots
            .par_iter_mut()
            .zip(actions.par_iter())
            .map(|(slot, action)| {
                let result = slot.env.step(action);
                slot.ep_return += result.reward;
                slot.ep_len += 1;

                if !result.done() {
                    return (result.observation, result.reward, false, false, None, None);
                }

                let stats = EpisodeStats { ret: slot.ep_return, len: slot.ep_len };
                slot.ep_return = 0.0;
                slot.ep_len = 0;
                slot.episodes += 1;
                // Distinct seed per episode, still reproducible per copy.
                let next_seed = slot.seed.wrapping_add(slot.episodes.wrapping_mul(10_007));
                let obs = slot.env.reset(Some(next_seed));
                let terminal = if result.truncated && !result.terminated {
                    Some(result.observation)
                } else {
                    None
                };
                (obs, result.reward, result.terminated, result.truncated, terminal, Some(stats))
            })
            .collect();

        let n = results.len();
        let mut out = VecStep {
            observations: Vec::with_capacity(n),
            rewards: Vec::with_capacity(n),
            terminated: Vec::with_capacity(n),
            truncated: Vec::with_capacity(n),
            terminal_observations: Vec::with_capacity(n),
            finished: Vec::with_capacity(n),
        };
        for (obs, reward, terminated, truncated, terminal, stats) in results {
            out.observations.push(obs);
            out.rewards.push(reward);
            out.terminated.push(terminated);
            out.truncated.push(truncated);
            out.terminal_observations.push(terminal);
            out.finished.push(stats);
        }
        out
    }

    /// Physical parameters of the first copy (all copies share them).
    pub fn parameters(&self) -> Vec<f64> {
        self.slots[0].env.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::super::env::testing::{self, CONSTANT_ID, EPISODE_LEN, TRUNCATING_ID};
    use super::super::hopper;
    use super::*;

    #[test]
    fn test_zero_envs_rejected() {
        let registry = testing::registry();
        let err = VecEnv::new(&registry, CONSTANT_ID, 0, 0).err().unwrap();
        assert_eq!(err, ConfigError::InvalidCount { field: "n_envs", value: 0 });
    }

    #[test]
    fn test_unknown_id_rejected() {
        let registry = testing::registry();
        let err = VecEnv::new(&registry, "CustomHopper-bogus-v0", 4, 0).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownEnvironment { .. }));
    }

    #[test]
    fn test_auto_reset_and_episode_stats() {
        let registry = testing::registry();
        let mut venv = VecEnv::new(&registry, CONSTANT_ID, 3, 0).unwrap();
        let obs = venv.reset();
        assert_eq!(obs.len(), 3);

        let actions = vec![vec![0.0]; 3];
        for step in 1..=EPISODE_LEN {
            let out = venv.step(&actions);
            for i in 0..3 {
                if step < EPISODE_LEN {
                    assert!(!out.done(i));
                    assert!(out.finished[i].is_none());
                } else {
                    assert!(out.terminated[i]);
                    assert_eq!(out.finished[i], Some(EpisodeStats { ret: EPISODE_LEN as f64, len: EPISODE_LEN }));
                    // Reset observation, not the terminal one
                    assert_eq!(out.observations[i], vec![0.0, 0.0]);
                    // Termination (not truncation) keeps no terminal observation
                    assert!(out.terminal_observations[i].is_none());
                }
            }
        }
    }

    #[test]
    fn test_truncation_keeps_terminal_observation() {
        let registry = testing::registry();
        let mut venv = VecEnv::new(&registry, TRUNCATING_ID, 2, 0).unwrap();
        venv.reset();

        let actions = vec![vec![0.0]; 2];
        for step in 1..=EPISODE_LEN {
            let out = venv.step(&actions);
            for i in 0..2 {
                if step < EPISODE_LEN {
                    assert!(!out.done(i));
                    assert!(out.terminal_observations[i].is_none());
                } else {
                    assert!(out.truncated[i]);
                    assert!(!out.terminated[i]);
                    assert!(out.done(i));
                    // Last observation of the cut episode, before the reset
                    assert_eq!(out.terminal_observations[i], Some(vec![1.0, 0.0]));
                    assert_eq!(out.observations[i], vec![0.0, 0.0]);
                    let stats = out.finished[i].unwrap();
                    assert_eq!(stats.len, EPISODE_LEN);
                    assert_eq!(stats.ret, EPISODE_LEN as f64);
                }
            }
        }
    }

    #[test]
    fn test_hopper_copies_are_seeded_independently() {
        let mut registry = EnvRegistry::new();
        hopper::register(&mut registry).unwrap();
        let mut venv = VecEnv::new(&registry, hopper::SOURCE_ID, 4, 11).unwrap();
        let obs = venv.reset();
        assert_eq!(obs.len(), 4);
        assert_ne!(obs[0], obs[1]);
        assert_eq!(venv.parameters(), hopper::Domain::Source.masses().to_vec());

        let mut again = VecEnv::new(&registry, hopper::SOURCE_ID, 4, 11).unwrap();
        assert_eq!(again.reset(), obs);
    }
}
