//! Source → target transfer experiment.
//!
//! Fixed protocol, strictly sequential:
//! train(source) → eval(source) → eval(target) → train(target) → eval(target).
//! Both source evaluations use the same trained artifact; the target
//! artifact is trained from scratch.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use super::env::{ConfigError, EnvRegistry};
use super::eval::{evaluate_policy, EvalResult};
use super::hopper::Domain;
use super::policy::PolicyArtifact;
use super::ppo::{self, PpoConfig};
use super::vec_env::VecEnv;
use crate::storage::{artifact_name, ArtifactStore};

/// Produces a trained artifact for an environment id.
pub trait Trainer {
    type Artifact;

    /// Print what is about to be trained on. Optional.
    fn describe(&self, _env_id: &str) -> Result<()> {
        Ok(())
    }

    fn train(&mut self, env_id: &str) -> Result<Arc<Self::Artifact>>;
}

/// Scores an artifact on an environment id.
pub trait Evaluator<A> {
    fn evaluate(&mut self, artifact: &Arc<A>, env_id: &str) -> Result<EvalResult>;
}

// ─── PPO-backed collaborators ───────────────────────────────────────

/// Trains PPO on a vectorized copy of the requested environment.
pub struct PpoTrainer<'a> {
    pub registry: &'a EnvRegistry,
    pub config: PpoConfig,
    pub total_timesteps: usize,
    pub n_envs: usize,
    pub seed: u64,
    pub verbose: bool,
    /// Where to persist each trained artifact, if anywhere.
    pub store: Option<ArtifactStore>,
}

impl Trainer for PpoTrainer<'_> {
    type Artifact = PolicyArtifact;

    fn describe(&self, env_id: &str) -> Result<()> {
        let env = self.registry.make(env_id, Some(self.seed))?;
        println!("State space: {}", env.config().observation_space);
        println!("Action space: {}", env.config().action_space);
        println!("Dynamics parameters: {:?}", env.parameters());
        Ok(())
    }

    fn train(&mut self, env_id: &str) -> Result<Arc<PolicyArtifact>> {
        let mut venv = VecEnv::new(self.registry, env_id, self.n_envs, self.seed)?;
        tracing::info!(env = %env_id, n_envs = self.n_envs, timesteps = self.total_timesteps, "Training PPO");
        let verbose = self.verbose;
        let artifact = ppo::learn(&mut venv, &self.config, self.total_timesteps, self.seed, |s| {
            ppo::log_update(s, verbose)
        })?;
        if let Some(store) = &self.store {
            store.save(&artifact_name_for(env_id), &artifact)?;
        }
        Ok(Arc::new(artifact))
    }
}

/// `model_ppo_<variant>` for the hopper variants, a sanitized id otherwise.
pub fn artifact_name_for(env_id: &str) -> String {
    match [Domain::Source, Domain::Target].into_iter().find(|d| d.env_id() == env_id) {
        Some(domain) => artifact_name(domain),
        None => {
            let slug: String = env_id
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect();
            format!("model_ppo_{slug}")
        }
    }
}

/// Runs full episodes on a fresh single environment.
pub struct EpisodeEvaluator<'a> {
    pub registry: &'a EnvRegistry,
    pub n_episodes: usize,
    pub deterministic: bool,
    pub seed: u64,
}

impl Evaluator<PolicyArtifact> for EpisodeEvaluator<'_> {
    fn evaluate(&mut self, artifact: &Arc<PolicyArtifact>, env_id: &str) -> Result<EvalResult> {
        let mut env = self.registry.make(env_id, Some(self.seed))?;
        let result = evaluate_policy(artifact.as_ref(), env.as_mut(), self.n_episodes, self.deterministic, self.seed)?;
        Ok(result)
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub source_on_source: EvalResult,
    pub source_on_target: EvalResult,
    pub target_on_target: EvalResult,
}

fn line(label: &str, r: &EvalResult) -> String {
    format!("{label}: {:.3} +/- {:.3}", r.mean, r.std)
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", line("source -> source", &self.source_on_source))?;
        writeln!(f, "{}", line("source -> target", &self.source_on_target))?;
        write!(f, "{}", line("target -> target", &self.target_on_target))
    }
}

#[derive(Debug, Clone)]
pub struct TransferExperiment {
    source_id: String,
    target_id: String,
}

impl TransferExperiment {
    /// Both ids are resolved up front so a typo fails before any training.
    pub fn new(registry: &EnvRegistry, source_id: &str, target_id: &str) -> Result<Self, ConfigError> {
        registry.resolve(source_id)?;
        registry.resolve(target_id)?;
        Ok(Self { source_id: source_id.to_string(), target_id: target_id.to_string() })
    }

    /// The hopper source and target variants.
    pub fn hopper(registry: &EnvRegistry) -> Result<Self, ConfigError> {
        Self::new(registry, Domain::Source.env_id(), Domain::Target.env_id())
    }

    pub fn run<T, E>(&self, trainer: &mut T, evaluator: &mut E) -> Result<TransferReport>
    where
        T: Trainer,
        E: Evaluator<T::Artifact>,
    {
        trainer.describe(&self.source_id)?;
        let source_model = trainer.train(&self.source_id)?;

        let source_on_source = evaluator.evaluate(&source_model, &self.source_id)?;
        println!("{}", line("source -> source", &source_on_source));
        let source_on_target = evaluator.evaluate(&source_model, &self.target_id)?;
        println!("{}", line("source -> target", &source_on_target));

        trainer.describe(&self.target_id)?;
        let target_model = trainer.train(&self.target_id)?;
        let target_on_target = evaluator.evaluate(&target_model, &self.target_id)?;
        println!("{}", line("target -> target", &target_on_target));

        tracing::info!(
            source_on_source = source_on_source.mean,
            source_on_target = source_on_target.mean,
            target_on_target = target_on_target.mean,
            "Transfer experiment finished"
        );
        Ok(TransferReport { source_on_source, source_on_target, target_on_target })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::super::env::testing::{self, CONSTANT_ID};
    use super::super::hopper;
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Train(String, usize),
        Eval(String, usize),
    }

    struct Model {
        id: usize,
    }

    struct StubTrainer {
        log: Rc<RefCell<Vec<Event>>>,
        trained: Vec<Arc<Model>>,
    }

    impl Trainer for StubTrainer {
        type Artifact = Model;

        fn train(&mut self, env_id: &str) -> Result<Arc<Model>> {
            let model = Arc::new(Model { id: self.trained.len() });
            self.log.borrow_mut().push(Event::Train(env_id.to_string(), model.id));
            self.trained.push(model.clone());
            Ok(model)
        }
    }

    struct StubEvaluator {
        log: Rc<RefCell<Vec<Event>>>,
        seen: Vec<Arc<Model>>,
    }

    impl Evaluator<Model> for StubEvaluator {
        fn evaluate(&mut self, artifact: &Arc<Model>, env_id: &str) -> Result<EvalResult> {
            self.log.borrow_mut().push(Event::Eval(env_id.to_string(), artifact.id));
            self.seen.push(artifact.clone());
            Ok(EvalResult::from_returns(vec![artifact.id as f64], vec![1]))
        }
    }

    fn hopper_registry() -> EnvRegistry {
        let mut registry = EnvRegistry::new();
        hopper::register(&mut registry).unwrap();
        registry
    }

    #[test]
    fn test_protocol_order_and_artifact_reuse() {
        let registry = hopper_registry();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut trainer = StubTrainer { log: log.clone(), trained: Vec::new() };
        let mut evaluator = StubEvaluator { log: log.clone(), seen: Vec::new() };

        let experiment = TransferExperiment::hopper(&registry).unwrap();
        let report = experiment.run(&mut trainer, &mut evaluator).unwrap();

        let src = hopper::SOURCE_ID.to_string();
        let tgt = hopper::TARGET_ID.to_string();
        assert_eq!(
            *log.borrow(),
            vec![
                Event::Train(src.clone(), 0),
                Event::Eval(src, 0),
                Event::Eval(tgt.clone(), 0),
                Event::Train(tgt.clone(), 1),
                Event::Eval(tgt, 1),
            ]
        );
        // Same object for both source evaluations, a fresh one for the target.
        assert!(Arc::ptr_eq(&evaluator.seen[0], &evaluator.seen[1]));
        assert!(!Arc::ptr_eq(&evaluator.seen[1], &evaluator.seen[2]));
        assert!(Arc::ptr_eq(&evaluator.seen[0], &trainer.trained[0]));
        assert_eq!(trainer.trained.len(), 2);
        assert_eq!(report.target_on_target.mean, 1.0);
    }

    #[test]
    fn test_unknown_target_fails_before_training() {
        let registry = hopper_registry();
        let err = TransferExperiment::new(&registry, hopper::SOURCE_ID, "CustomHopper-bogus-v0").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnvironment { ref id, .. } if id == "CustomHopper-bogus-v0"));
    }

    #[test]
    fn test_trainer_rejects_unknown_id() {
        let registry = hopper_registry();
        let mut trainer = PpoTrainer {
            registry: &registry,
            config: PpoConfig::default(),
            total_timesteps: 1_000,
            n_envs: 4,
            seed: 0,
            verbose: false,
            store: None,
        };
        let err = trainer.train("CustomHopper-bogus-v0").unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().expect("config error");
        assert!(matches!(config_err, ConfigError::UnknownEnvironment { .. }));
    }

    #[test]
    fn test_report_format() {
        let r = EvalResult::from_returns(vec![1.0, 3.0], vec![1, 1]);
        let report = TransferReport {
            source_on_source: r.clone(),
            source_on_target: r.clone(),
            target_on_target: r,
        };
        let text = report.to_string();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(text.lines().next().unwrap(), "source -> source: 2.000 +/- 1.000");
        assert!(text.lines().nth(2).unwrap().starts_with("target -> target:"));
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(artifact_name_for(hopper::SOURCE_ID), "model_ppo_source");
        assert_eq!(artifact_name_for(hopper::TARGET_ID), "model_ppo_target");
        assert_eq!(artifact_name_for("Constant-v0"), "model_ppo_constant_v0");
    }

    #[test]
    fn test_ppo_collaborators_end_to_end() {
        let registry = testing::registry();
        let mut trainer = PpoTrainer {
            registry: &registry,
            config: PpoConfig { n_steps: 16, batch_size: 8, n_epochs: 1, hidden: vec![4], ..PpoConfig::default() },
            total_timesteps: 32,
            n_envs: 2,
            seed: 1,
            verbose: false,
            store: None,
        };
        let mut evaluator = EpisodeEvaluator { registry: &registry, n_episodes: 5, deterministic: false, seed: 0 };
        let experiment = TransferExperiment::new(&registry, CONSTANT_ID, CONSTANT_ID).unwrap();
        let report = experiment.run(&mut trainer, &mut evaluator).unwrap();
        assert_eq!(report.source_on_source.mean, 10.0);
        assert_eq!(report.source_on_target.std, 0.0);
        assert_eq!(report.target_on_target.episode_returns.len(), 5);
    }
}
